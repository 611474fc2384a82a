//! Generated protobuf/tonic types for the `portal.v1` package. See
//! `proto/portal.proto` for the source of truth and `build.rs` for codegen.

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/portal.v1.rs"));
