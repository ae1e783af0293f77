use ndarray::{Array2, Axis};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CollapseError {
    #[error("Group size must be at least 1")]
    ZeroGroupSize,
}

/// Reduce a frames × D embedding matrix by averaging consecutive groups of
/// `group_size` rows. A trailing partial group is averaged into one final row.
///
/// `frames = 3 * G + 2` rows collapse to 4 rows; an empty input collapses to
/// an empty (0 × D) matrix.
pub fn collapse(frames: &Array2<f32>, group_size: usize) -> Result<Array2<f32>, CollapseError> {
    if group_size == 0 {
        return Err(CollapseError::ZeroGroupSize);
    }

    let (rows, dims) = frames.dim();
    let groups = rows.div_ceil(group_size);
    let mut out = Array2::<f32>::zeros((groups, dims));

    for (g, chunk) in frames.axis_chunks_iter(Axis(0), group_size).enumerate() {
        if let Some(mean) = chunk.mean_axis(Axis(0)) {
            out.row_mut(g).assign(&mean);
        }
    }

    Ok(out)
}
