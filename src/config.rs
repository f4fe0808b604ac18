use clap::{Args, ValueEnum};
use core::{num::NonZeroUsize, str::FromStr};
use std::path::PathBuf;
use thiserror::Error;

/// Fatal setup error, reported before any kernel runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("couldn't create work queue type {0}")]
    UnknownWorkQueue(String),
    #[error("invalid thread count in work queue type {0}")]
    InvalidThreadCount(String),
    #[error("couldn't start work queue {name}: {reason}")]
    WorkQueueStartup { name: String, reason: String },
    #[error("unknown allocator type {0}")]
    UnknownAllocator(String),
}

/// Host allocator selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum AllocatorKind {
    /// Global allocator.
    #[default]
    Malloc,
    /// Fixed-size block allocator for tests.
    TestFixedSize,
    /// Global allocator with allocation statistics.
    Profiled,
    /// Global allocator with leak detection.
    LeakCheck,
}

impl AllocatorKind {
    /// Human-readable description printed by the driver.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::TestFixedSize => "fixed size malloc",
            Self::Profiled => "profiled allocator based on malloc",
            Self::LeakCheck => "memory leak check allocator",
        }
    }
}

impl FromStr for AllocatorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true).map_err(|_| ConfigError::UnknownAllocator(s.into()))
    }
}

/// Task queue selection, parsed from `s`, `mstd[:N]` or `rayon[:N]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkQueueKind {
    /// No worker threads: tasks run on the thread that awaits or quiesces.
    SingleThreaded,
    /// Fixed pool of std threads sharing one FIFO.
    ThreadPool { threads: NonZeroUsize },
    /// Rayon work-stealing pool.
    WorkStealing { threads: NonZeroUsize },
}

impl FromStr for WorkQueueKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, threads) = match s.split_once(':') {
            Some((name, count)) => {
                let threads = count
                    .parse::<NonZeroUsize>()
                    .map_err(|_| ConfigError::InvalidThreadCount(s.into()))?;
                (name, Some(threads))
            }
            None => (s, None),
        };
        let default_threads = || {
            std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
        };
        match (name, threads) {
            ("s", None) => Ok(Self::SingleThreaded),
            ("mstd", threads) => Ok(Self::ThreadPool {
                threads: threads.unwrap_or_else(default_threads),
            }),
            ("rayon", threads) => Ok(Self::WorkStealing {
                threads: threads.unwrap_or_else(default_threads),
            }),
            _ => Err(ConfigError::UnknownWorkQueue(s.into())),
        }
    }
}

/// Command-line configuration of the reference driver.
#[derive(Debug, Clone, Args)]
pub struct RunConfig {
    /// Binary program to run.
    pub input: PathBuf,

    /// Function to run; repeatable. Defaults to every named function without
    /// arguments.
    #[arg(short = 'f', long = "function")]
    pub functions: Vec<String>,

    /// Host allocator.
    #[arg(long, value_enum, default_value_t = AllocatorKind::Malloc)]
    pub allocator: AllocatorKind,

    /// Work queue: `s`, `mstd[:N]` or `rayon[:N]`.
    #[arg(long, default_value = "s")]
    pub work_queue: String,

    /// Extension library registering additional kernels; repeatable.
    #[arg(long = "shared-lib")]
    pub shared_libs: Vec<PathBuf>,

    /// Substring of a diagnostic the run is expected to emit; repeatable.
    #[arg(long = "expected-diagnostic")]
    pub expected_diagnostics: Vec<String>,
}

impl RunConfig {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            functions: Vec::new(),
            allocator: AllocatorKind::default(),
            work_queue: "s".into(),
            shared_libs: Vec::new(),
            expected_diagnostics: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_work_queue_kinds() {
        assert_eq!("s".parse(), Ok(WorkQueueKind::SingleThreaded));
        assert_eq!(
            "mstd:3".parse(),
            Ok(WorkQueueKind::ThreadPool {
                threads: NonZeroUsize::new(3).unwrap()
            })
        );
        assert!(matches!(
            "rayon".parse::<WorkQueueKind>(),
            Ok(WorkQueueKind::WorkStealing { .. })
        ));
        assert_eq!(
            "fifo".parse::<WorkQueueKind>(),
            Err(ConfigError::UnknownWorkQueue("fifo".into()))
        );
        assert_eq!(
            "mstd:0".parse::<WorkQueueKind>(),
            Err(ConfigError::InvalidThreadCount("mstd:0".into()))
        );
        assert!("s:2".parse::<WorkQueueKind>().is_err());
    }

    #[test]
    fn parses_allocator_kinds() {
        assert_eq!("leak-check".parse(), Ok(AllocatorKind::LeakCheck));
        assert_eq!("test-fixed-size".parse(), Ok(AllocatorKind::TestFixedSize));
        assert_eq!(
            "jemalloc".parse::<AllocatorKind>(),
            Err(ConfigError::UnknownAllocator("jemalloc".into()))
        );
    }
}
