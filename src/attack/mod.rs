mod host;
pub mod static_nested;

pub use host::{InputArguments, PwnHost};
pub use static_nested::StaticNestedResult;
