//! Asynchronous operations: lifecycle, capabilities and the tracker

pub mod operation;
pub mod tracker;

pub use operation::{
    Canceller, ChannelAcceptor, CooperativeCancel, Operation, OperationClass, OperationContext,
    OperationSpec, OperationStatus, OperationType, OperationView, Runner,
};
pub use tracker::OperationTracker;
