//! The Mica virtual-memory layer.
//!
//! Demand paging over the substrate's simulated paging hardware. Three
//! pieces cooperate on every page fault and every eviction:
//!
//! - [`page::SupplPageTable`], the per-process record of how each user
//!   page is backed (zero-fill, file window, or swap slot).
//! - [`frame::FrameTable`], the process-wide table of user frames with
//!   clock eviction over hardware accessed bits.
//! - [`swap::SwapTable`], the slot allocator over the swap device.
//!
//! A fault materializes a page through
//! [`page::SupplPageTable::load`]: classify the page, obtain a frame
//! (evicting someone else's page if needed), fill it from its provenance,
//! and install the hardware mapping. Eviction runs the same machinery in
//! reverse, funneling dirty content into swap slots.
pub mod frame;
pub mod page;
pub mod swap;

pub use frame::FrameTable;
pub use page::{PageSource, Spte, SupplPageTable};
pub use swap::SwapTable;
