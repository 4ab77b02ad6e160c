mod finalizer;
mod memory;
mod owner;
mod runner;
mod status;
mod store;
mod upsert;

pub use finalizer::*;
pub use memory::*;
pub use owner::*;
pub use runner::*;
pub use status::*;
pub use store::*;
pub use upsert::*;

pub use unito_operator_core::{
    Action, CancellationToken, ObjectKey, OperationResult, ReconcileError, Reconciler, Request,
    StoreError,
};
