//! Observability glue for Duramen.

pub mod tracing_setup;
