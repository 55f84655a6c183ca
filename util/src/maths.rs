//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

/// Map a value from one range into another.
pub fn lin_map<T>(source_range: (T, T), target_range: (T, T), value: T) -> T
where
    T: Float
{
    target_range.0
        + ((value - source_range.0)
        * (target_range.1 - target_range.0)
        / (source_range.1 - source_range.0))
}

/// Clamp a value into `[min, max]`.
pub fn clamp<T>(value: &T, min: &T, max: &T) -> T
where
    T: Float
{
    let mut ret = *value;

    if ret > *max {
        ret = *max
    }
    if ret < *min {
        ret = *min
    }

    ret
}

/// Clamp a value into `[-limit, limit]`.
pub fn clamp_sym<T>(value: T, limit: T) -> T
where
    T: Float
{
    clamp(&value, &(-limit.abs()), &limit.abs())
}

/// Zero any value whose magnitude is below the band.
pub fn deadband<T>(value: T, band: T) -> T
where
    T: Float
{
    if value.abs() < band {
        T::zero()
    }
    else {
        value
    }
}

/// Exponential smoothing, `alpha` is the weight of the previous value.
pub fn smooth<T>(previous: T, new: T, alpha: T) -> T
where
    T: Float
{
    alpha * previous + (T::one() - alpha) * new
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lin_map() {
        assert_eq!(lin_map((0f64, 2f64), (0f64, 10f64), 1f64), 5f64);
        assert_eq!(lin_map((-1f64, 1f64), (0f64, 10f64), 1f64), 10f64);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(&3f64, &0f64, &2f64), 2f64);
        assert_eq!(clamp(&-3f64, &0f64, &2f64), 0f64);
        assert_eq!(clamp(&1f64, &0f64, &2f64), 1f64);

        assert_eq!(clamp_sym(2f64, 1.5f64), 1.5f64);
        assert_eq!(clamp_sym(-2f64, 1.5f64), -1.5f64);
        assert_eq!(clamp_sym(-2f64, -1.5f64), -1.5f64);
    }

    #[test]
    fn test_deadband_and_smooth() {
        assert_eq!(deadband(0.05f64, 0.1f64), 0f64);
        assert_eq!(deadband(-0.2f64, 0.1f64), -0.2f64);

        assert_eq!(smooth(1f64, 0f64, 0.75f64), 0.75f64);
        assert_eq!(smooth(0f64, 1f64, 0f64), 1f64);
    }
}
