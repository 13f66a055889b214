use statrs::statistics::Statistics;

/// info! that keeps ANSI colors only when the first argument is true
#[macro_export]
macro_rules! cinfo {
    ($colorful:expr, $($arg:tt)*) => {
        if $colorful {
            log::info!($($arg)*);
        } else {
            log::info!("{}", $crate::utils::strip_ansi(&format!($($arg)*)));
        }
    };
}

/// Removes ANSI escape sequences (ESC '[' ... final letter)
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits `vec` into `p` contiguous chunks whose sizes differ by at most one, the first
/// `len % p` chunks taking one extra element. Order is preserved.
pub fn split_into_balanced_chunks<T: Clone>(vec: Vec<T>, p: usize) -> Vec<Vec<T>> {
    let p = p.max(1);
    let n = vec.len();
    let base_size = n / p;
    let extra_elements = n % p;

    let mut chunks = Vec::with_capacity(p);
    let mut start = 0;

    for i in 0..p {
        let chunk_size = base_size + if i < extra_elements { 1 } else { 0 };
        let end = start + chunk_size;
        chunks.push(vec[start..end].to_vec());
        start = end;
    }

    chunks
}

/// Mean and sample standard deviation; (NaN, NaN) for an empty slice, std 0 for one value
pub fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let mean = values.iter().mean();
    let std = if values.len() > 1 {
        values.iter().std_dev()
    } else if values.len() == 1 {
        0.0
    } else {
        f64::NAN
    };
    (mean, std)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_into_balanced_chunks() {
        let chunks = split_into_balanced_chunks((0..10).collect::<Vec<usize>>(), 4);
        assert_eq!(
            chunks,
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7], vec![8, 9]]
        );

        let more_workers_than_items = split_into_balanced_chunks(vec![1, 2], 4);
        assert_eq!(more_workers_than_items, vec![vec![1], vec![2], vec![], vec![]]);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;93mFold #1\x1b[0m done"), "Fold #1 done");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_mean_and_std() {
        let (mean, std) = mean_and_std(&[0.5, 0.7, 0.9]);
        assert!((mean - 0.7).abs() < 1e-12);
        assert!((std - 0.2).abs() < 1e-12);
        assert_eq!(mean_and_std(&[0.8]), (0.8, 0.0));
        assert!(mean_and_std(&[]).0.is_nan());
    }
}
