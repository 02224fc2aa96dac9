//! Lock-free multi-producer multi-consumer queues.
//!
//! [`Queue`] is unbounded: it grows in fixed-size chunks as producers run
//! past the end and frees chunks once they have been drained. Neither
//! [`push`](Queue::push) nor [`pop`](Queue::pop) ever blocks on another
//! thread that hasn't started its operation.
//!
//! [`bounded::Queue`] is a fixed-capacity ring for when memory must stay
//! bounded. Pushing onto a full ring hands the value back in a [`Full`]
//! error.
//!
//! ```
//! use sprawl_queue::Queue;
//!
//! let queue = Queue::new();
//! queue.push(1);
//! queue.push(2);
//!
//! assert_eq!(queue.pop(), Some(1));
//! assert_eq!(queue.pop(), Some(2));
//! assert_eq!(queue.pop(), None);
//! ```

mod error;
mod segment;
mod sync;
mod unbounded;

pub mod bounded;

pub use error::Full;
pub use unbounded::{Queue, DEFAULT_CHUNK_SIZE};
