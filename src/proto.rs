//! Generated Cloudstate protocol types.
//!
//! The module tree mirrors the proto package tree so that cross-package
//! references in the generated code resolve (`cloudstate.eventsourced`
//! refers back to `cloudstate.Command`, `cloudstate.ClientAction`, etc.).

pub mod cloudstate {
    tonic::include_proto!("cloudstate");

    pub mod eventsourced {
        tonic::include_proto!("cloudstate.eventsourced");
    }

    pub mod action {
        tonic::include_proto!("cloudstate.action");
    }

    pub mod function {
        tonic::include_proto!("cloudstate.function");
    }
}

pub use cloudstate::{
    client_action, ClientAction, Command, Entity, EntitySpec, Failure, Forward, ProxyInfo, Reply,
    ServiceInfo, SideEffect, UserFunctionError,
};
