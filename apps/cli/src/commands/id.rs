//! Id command implementation.

use callsheet_orchestrator::next_id;

/// Prints a fresh id, or the one memoised under `shared`.
pub fn execute(length: usize, shared: Option<&str>) {
    println!("{}", next_id(shared, length));
}
