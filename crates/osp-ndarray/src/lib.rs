#![forbid(unsafe_code)]

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    Overflow,
    IncompatibleBroadcast { lhs: Vec<usize>, rhs: Vec<usize> },
    RankTooHigh { rank: usize, max: usize },
}

impl ShapeError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Overflow => "shape_overflow",
            Self::IncompatibleBroadcast { .. } => "incompatible_broadcast",
            Self::RankTooHigh { .. } => "rank_too_high",
        }
    }
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overflow => write!(f, "size arithmetic overflow"),
            Self::IncompatibleBroadcast { lhs, rhs } => {
                write!(f, "cannot broadcast {lhs:?} with {rhs:?}")
            }
            Self::RankTooHigh { rank, max } => {
                write!(f, "rank {rank} exceeds supported maximum {max}")
            }
        }
    }
}

impl std::error::Error for ShapeError {}

#[must_use]
pub fn can_broadcast(lhs: &[usize], rhs: &[usize]) -> bool {
    broadcast_shape(lhs, rhs).is_ok()
}

/// Merges two shapes under the usual trailing-alignment broadcast rules.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let nd = lhs.len().max(rhs.len());
    let mut out = vec![0usize; nd];

    let mut l_iter = lhs.iter().rev();
    let mut r_iter = rhs.iter().rev();
    for slot in out.iter_mut().rev() {
        let l = l_iter.next().copied().unwrap_or(1);
        let r = r_iter.next().copied().unwrap_or(1);
        *slot = if l == r || r == 1 {
            l
        } else if l == 1 {
            r
        } else {
            return Err(ShapeError::IncompatibleBroadcast {
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            });
        };
    }

    Ok(out)
}

pub fn broadcast_shapes(shapes: &[&[usize]]) -> Result<Vec<usize>, ShapeError> {
    let mut acc = Vec::new();
    for shape in shapes {
        acc = broadcast_shape(&acc, shape)?;
    }
    Ok(acc)
}

pub fn element_count(shape: &[usize]) -> Result<usize, ShapeError> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim).ok_or(ShapeError::Overflow)
    })
}

#[cfg(test)]
mod tests {
    use super::{ShapeError, broadcast_shape, broadcast_shapes, can_broadcast, element_count};

    #[test]
    fn broadcast_shape_aligns_trailing_axes() {
        let out = broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5]).expect("broadcast should succeed");
        assert_eq!(out, vec![8, 7, 6, 5]);
    }

    #[test]
    fn broadcast_shape_rejects_incompatible_shapes() {
        let err = broadcast_shape(&[4, 3], &[5, 3]).expect_err("should fail");
        assert!(matches!(err, ShapeError::IncompatibleBroadcast { .. }));
        assert!(!can_broadcast(&[4, 3], &[5, 3]));
    }

    #[test]
    fn broadcast_scalar_against_tensor() {
        let out = broadcast_shape(&[], &[2, 3]).expect("scalar broadcast");
        assert_eq!(out, vec![2, 3]);
    }

    #[test]
    fn broadcast_many_shapes() {
        let shapes: [&[usize]; 3] = [&[3, 1], &[1, 7], &[5, 3, 7]];
        let out = broadcast_shapes(&shapes).expect("broadcast should succeed");
        assert_eq!(out, vec![5, 3, 7]);
    }

    #[test]
    fn element_count_multiplies_dimensions() {
        assert_eq!(element_count(&[2, 3, 4]).expect("count"), 24);
        assert_eq!(element_count(&[]).expect("scalar count"), 1);
    }

    #[test]
    fn element_count_detects_overflow() {
        let err = element_count(&[usize::MAX, 2]).expect_err("should overflow");
        assert_eq!(err, ShapeError::Overflow);
        assert_eq!(err.reason_code(), "shape_overflow");
    }
}
