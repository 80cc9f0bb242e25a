//! Configuration parsing and types.
//!
//! - `descriptor` - torrc descriptor files (`ConfigDescriptor`, `DescriptorKind`)
//! - `labels` - the exit label vocabulary
//! - `settings` - manager settings (`Settings`)
//! - `duration` - human duration strings

mod descriptor;
mod duration;
mod labels;
mod settings;

pub use descriptor::*;
pub use duration::*;
pub use labels::*;
pub use settings::*;
