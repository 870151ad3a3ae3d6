//! Test-only crate. The broker harness lives in `tests/helpers`.
