//! Process load monitoring used by the worker pool.

mod resources;

pub use resources::{
    LoadAverage, LoadHistory, LoadSample, LoadSampler, ProcessSampler, WorkerProcess,
};
