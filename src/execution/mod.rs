pub mod functions;
pub mod operator;
pub mod ordering;
pub mod pages_index;
pub mod partition;
pub mod window;

pub use functions::*;
pub use operator::*;
pub use ordering::*;
pub use pages_index::*;
pub use partition::*;
pub use window::*;
