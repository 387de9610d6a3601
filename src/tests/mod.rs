//! Integration-style tests that drive the table/client/upstream/filter
//! components together, in the style of the teacher's `src/tests/` layout.
//! Unit tests for a single module stay next to that module in a
//! `#[cfg(test)]` block; this tree is for scenarios that only make sense
//! wired end-to-end.

mod e2e_test;
