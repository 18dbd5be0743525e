pub mod collection;
pub mod item;
pub mod page;
pub mod task;
pub mod timestamp;

pub use collection::Collection;
pub use item::{Item, ItemId};
pub use page::Page;
pub use task::{Task, TaskStatus};
