pub mod analyzer;
pub mod index;
pub mod spimi;

pub use analyzer::Analyzer;
pub use index::TextIndex;

/// Logarithmic term-frequency weight: `1 + log tf`.
pub fn tf_weight(tf: u32) -> f64 {
    if tf == 0 {
        0.0
    } else {
        1.0 + (tf as f64).log10()
    }
}

/// Inverse document frequency: `log(N/df)`, clamped at zero so a term
/// present in (nearly) every document carries no weight.
pub fn idf_weight(doc_count: u64, df: u32) -> f64 {
    if doc_count == 0 || df == 0 {
        0.0
    } else {
        (doc_count as f64 / df as f64).log10().max(0.0)
    }
}
