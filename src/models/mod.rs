mod cost;
mod metric;
mod report;

pub use cost::*;
pub use metric::*;
pub use report::*;
