mod undo_redo;

pub use undo_redo::*;
