//! Built-in sources.

mod synthetic;

pub use synthetic::SyntheticPlugin;
