pub mod cursor;
pub mod store;

pub use cursor::CursorStore;
pub use store::DocumentStore;
