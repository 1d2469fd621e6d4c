//! Template expansion seam.
//!
//! Turning one template plus named variable lists into concrete requests is
//! owned by the caller. The dispatcher only needs the resulting ordered list
//! and enforces `max_combinations` on it.

use crate::types::Request;
use crate::Result;
use std::collections::HashMap;

/// Produces the requests of one batch from a template.
pub trait TemplateExpander: Send + Sync {
    /// Expand `template` over `variables`.
    ///
    /// Implementations should stop at `max_combinations`; the dispatcher
    /// rejects longer outputs either way.
    fn expand(
        &self,
        template: &str,
        variables: &HashMap<String, Vec<String>>,
        max_combinations: usize,
    ) -> Result<Vec<Request>>;
}

impl<F> TemplateExpander for F
where
    F: Fn(&str, &HashMap<String, Vec<String>>, usize) -> Result<Vec<Request>> + Send + Sync,
{
    fn expand(
        &self,
        template: &str,
        variables: &HashMap<String, Vec<String>>,
        max_combinations: usize,
    ) -> Result<Vec<Request>> {
        self(template, variables, max_combinations)
    }
}
