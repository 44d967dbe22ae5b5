//! Kiln Runner Library
//!
//! ## Layer 2 - Execution
//!
//! Consumes `run_build` tasks and executes builds: a [`Runner`] walks the
//! stages of a build, running the jobs of each stage concurrently on a
//! [`Driver`], and streams artifacts back into the blob store through an
//! [`ArtifactCollector`]. The [`OsDriver`] runs jobs as shell scripts in a
//! temporary workspace on the host.

pub mod collector;
pub mod driver;
pub mod error;
pub mod keychain;
pub mod os;
pub mod output;
pub mod placer;
pub mod runner;
pub mod worker;

pub use collector::{ArtifactCollector, HashingReader};
pub use driver::{
    Collector, Driver, DriverFactory, DriverRegistry, DriverSpec, Environment, Job, Placer,
};
pub use error::{DriverError, Result, RunnerError, TransferError};
pub use keychain::KeyChain;
pub use os::OsDriver;
pub use output::{Output, MASK};
pub use placer::{NoObjects, ObjectPlacer};
pub use runner::{JobPlan, JobReport, RunObserver, RunReport, Runner, StagePlan};
pub use worker::Worker;
