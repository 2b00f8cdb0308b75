//! Cross-crate tests for the dbt86 workspace, organized by the
//! module under test. Single-crate unit tests live next to their
//! code; everything here exercises crate boundaries — executing
//! emitted host code, the translation cache discipline, and full
//! guest programs through the dispatcher.

#[cfg(test)]
mod backend;
#[cfg(test)]
mod exec;
#[cfg(test)]
mod integration;
