//! Cross-crate tests for RatoNet; the suites live in `tests/`.
