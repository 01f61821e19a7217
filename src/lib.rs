pub mod app;
pub mod cli;
pub mod config;
pub mod groups;
pub mod query;
pub mod search;
pub mod service;
pub mod storage;
pub mod ui;
pub mod view;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use groups::{GroupCollapseState, GroupKey, GroupStateStore};
pub use query::{QueryController, Snapshot};
pub use view::{ListMutationApplier, OperationBatch, Projector};
