mod bitmap;
mod error;
mod pool;
mod segbuf;

pub use bitmap::NodeBitmap;
pub use error::{err, Error, Result};
pub use pool::{Ix, Pool};
pub use segbuf::{SegList, SegPool, SEG_WORDS};

#[cfg(test)]
mod test;
