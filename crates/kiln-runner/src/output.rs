//! Captured build and job output.
//!
//! An [`Output`] is a cheaply cloneable handle over a shared text buffer.
//! Secret values registered as masks never reach the buffer: every write
//! replaces them with [`MASK`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Replacement for masked values.
pub const MASK: &str = "xxxxxx";

#[derive(Clone, Default)]
pub struct Output {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    masks: Vec<String>,
    buf: Mutex<String>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    /// An output that hides every non-empty value in `masks`.
    pub fn with_masks<I, S>(masks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut masks: Vec<String> = masks
            .into_iter()
            .map(Into::into)
            .filter(|m| !m.is_empty())
            .collect();
        // Longest first, so a secret containing another is hidden whole.
        masks.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        masks.dedup();
        Self {
            inner: Arc::new(Inner {
                masks,
                buf: Mutex::new(String::new()),
            }),
        }
    }

    /// A fresh, empty output sharing this output's masks.
    pub fn child(&self) -> Self {
        Self::with_masks(self.inner.masks.iter().cloned())
    }

    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for m in &self.inner.masks {
            if out.contains(m.as_str()) {
                out = out.replace(m.as_str(), MASK);
            }
        }
        out
    }

    pub fn write_str(&self, text: &str) {
        let masked = self.mask(text);
        self.buf().push_str(&masked);
    }

    /// Append `line` followed by a newline.
    pub fn line(&self, line: &str) {
        let mut masked = self.mask(line);
        masked.push('\n');
        self.buf().push_str(&masked);
    }

    pub fn contents(&self) -> String {
        self.buf().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.buf().is_empty()
    }

    fn buf(&self) -> std::sync::MutexGuard<'_, String> {
        self.inner.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("masks", &self.inner.masks.len())
            .field("len", &self.buf().len())
            .finish()
    }
}
