pub(crate) mod add_piece;
pub(crate) mod checksum;
pub(crate) mod locate_piece;
pub(crate) mod seal;
pub(crate) mod snapshots;

pub use self::add_piece::*;
pub use self::checksum::*;
pub use self::locate_piece::*;
pub use self::seal::*;
pub use self::snapshots::*;
