pub mod copy_dir;
pub mod hardlink;
pub mod remove;
pub mod replace_dir;
pub mod symlink;

pub use copy_dir::copy_dir_all;
pub use hardlink::{FallbackStrategy, HardlinkOrCopyOptions, hardlink_or_copy};
pub use remove::remove_path;
pub use replace_dir::replace_dir;
pub use symlink::create_symlink;
