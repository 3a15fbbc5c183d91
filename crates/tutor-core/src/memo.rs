//! Hook applied to the Librarian memo before it reaches Solver and Examiner.
//!
//! The grounding cap bounds textbook context only; memo length is governed
//! here. The default leaves the memo untouched.

use tracing::warn;

pub trait MemoPolicy: Send + Sync {
    fn prepare(&self, memo: String) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl MemoPolicy for PassThrough {
    fn prepare(&self, memo: String) -> String {
        memo
    }
}

/// Keeps at most `n` characters of the memo.
#[derive(Debug, Clone, Copy)]
pub struct CharBudget(pub usize);

impl MemoPolicy for CharBudget {
    fn prepare(&self, mut memo: String) -> String {
        if let Some((cut, _)) = memo.char_indices().nth(self.0) {
            warn!(budget = self.0, "research memo exceeds budget; keeping prefix");
            memo.truncate(cut);
        }
        memo
    }
}
