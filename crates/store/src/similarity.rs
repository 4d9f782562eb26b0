use ndarray::ArrayView1;

/// Distance reported when either vector has no direction
pub const ZERO_NORM_DISTANCE: f32 = 1.0;

/// L2 norm of a vector
pub fn l2_norm(v: &[f32]) -> f32 {
    let view = ArrayView1::from(v);
    view.dot(&view).sqrt()
}

/// Cosine distance `1 - cos(a, b)`
///
/// A zero-norm vector on either side yields 1.0 instead of NaN. Callers
/// guarantee equal lengths.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);

    let norm_product = a.dot(&a).sqrt() * b.dot(&b).sqrt();
    if norm_product == 0.0 || !norm_product.is_finite() {
        return ZERO_NORM_DISTANCE;
    }

    let similarity = (a.dot(&b) / norm_product).clamp(-1.0, 1.0);
    1.0 - similarity
}
