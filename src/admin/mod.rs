//! Observable state for operators: live views of connected slaves and the
//! jobs running on them, plus the automated scheduler that keeps the pool
//! busy.

pub mod job;
pub mod live_job;
pub mod live_master;
pub mod live_task;
pub mod notify;
pub mod scheduler;

pub use job::Job;
pub use live_job::LiveJob;
pub use live_master::LiveMaster;
pub use live_task::LiveTask;
pub use notify::ChangeNotifier;
pub use scheduler::Scheduler;
