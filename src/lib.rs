//! Thread-state transitions for native code calling into a managed runtime.
//!
//! Native code enters the runtime through a [`ThreadStateGuard`], which moves
//! the calling thread to Runnable (passing a checkpoint, so a pending pause is
//! honored first) and back to Native when dropped. While Runnable, handles
//! received from native code are decoded into direct references through a
//! [`ReferenceDecoder`]. The collector pauses threads with
//! [`ThreadRegistry::suspend_all`] and only ever touches reference tables while
//! no other thread is Runnable.

pub mod config;
pub mod copy;
pub mod decode;
pub mod error;
pub mod guard;
pub mod irt;
pub mod monitor;
pub mod policy;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod safepoint;
pub mod state;
pub mod thread;
pub mod utils;

pub use config::Config;
pub use copy::{get_array_elements, get_string_utf_chars, Elements, ReleaseMode, StringChars};
pub use decode::{Decoded, ReferenceDecoder};
pub use error::{Error, Result};
pub use guard::ThreadStateGuard;
pub use policy::ForceCopyPolicy;
pub use reference::{Handle, ObjectRef, RefKind, ReferenceTable, Resolved};
pub use registry::ThreadRegistry;
pub use runtime::Runtime;
pub use safepoint::{StopTheWorld, SuspendedThread};
pub use state::ThreadState;
pub use thread::ThreadEntry;
