pub mod pidcell;
pub mod queue;
pub mod sem;
pub mod shm;
pub mod singleton;

pub use pidcell::PidCell;
pub use queue::SharedQueue;
pub use sem::{NamedSemaphore, PrivateSemaphore};
pub use singleton::{SingletonLock, TryLockOutcome};
