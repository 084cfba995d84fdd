//! Root crate for the `quantctl` workspace.
//!
//! This crate intentionally carries no domain logic: it exists so that
//! workspace-level end-to-end tests have a home without introducing a
//! circular dependency between the domain crates. All supervisory logic
//! lives in `quantctl-shared` and `quantctl-orchestration`; the deployable
//! binary is `quantctl-orchestration`'s `quantctl-server`.
