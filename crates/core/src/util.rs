//! Small container utilities shared by the engine and its callers.
//!
//! Vectors handed to the engine are identified by address, never by value:
//! a caller may legitimately hold two distinct trial vectors with identical
//! contents.

/// Borrow every element of a slice, preserving order.
pub fn wrap<T>(seq: &[T]) -> Vec<&T> {
    seq.iter().collect()
}

/// Given references previously produced by [`wrap`] (possibly a subset, in
/// any order) and the original backing slice, return the indices into `seq`
/// of the elements that are wrapped, in ascending order.
pub fn find_ref<T>(wrapped: &[&T], seq: &[T]) -> Vec<usize> {
    let mut indices = Vec::new();
    for (i, item) in seq.iter().enumerate() {
        let addr = item as *const T;
        if wrapped.iter().any(|w| std::ptr::eq(*w as *const T, addr)) {
            indices.push(i);
        }
    }
    indices
}

/// Return a copy of `seq` with the elements at `indices` removed, preserving
/// the order of the survivors. Indices out of range or duplicated are
/// ignored.
pub fn remove_elements<T: Clone>(seq: &[T], indices: &[usize]) -> Vec<T> {
    seq.iter()
        .enumerate()
        .filter(|(i, _)| !indices.contains(i))
        .map(|(_, v)| v.clone())
        .collect()
}
