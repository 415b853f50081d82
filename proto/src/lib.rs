pub mod decision;
pub mod encoding;
pub mod error;
pub mod id;
pub mod transaction;
pub mod tuple;
pub mod update;

pub use decision::*;
pub use encoding::*;
pub use error::*;
pub use id::*;
pub use transaction::*;
pub use tuple::*;
pub use update::*;
