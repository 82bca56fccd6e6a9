//! Fiber bundles partitioning

use std::ops::Range;

use crate::error::InputError;

/// Partitions a bundle of `bundlesize` fibers into `n` subbundles
///
/// Returns `(subbundles, extract_subbundles)`: the indices belonging to each subbundle
/// and the indices to extract for each subbundle, the latter including one fiber of
/// overlap on each side except at the first and last fiber of the bundle.
///
/// `split_bundle(10, 3)` returns
/// ```text
/// ([[0, 1, 2], [3, 4, 5], [6, 7, 8, 9]],
///  [[0, 1, 2, 3], [2, 3, 4, 5, 6], [5, 6, 7, 8, 9]])
/// ```
pub fn split_bundle(
    bundlesize: usize,
    n: usize,
) -> Result<(Vec<Vec<usize>>, Vec<Vec<usize>>), InputError> {
    if n == 0 {
        return Err(InputError::NoSubbundle);
    }
    if n > bundlesize {
        return Err(InputError::TooManySubbundles { n, bundlesize });
    }
    // near equal partition, the larger subbundles first
    let mut n_per_subbundle: Vec<usize> = (0..n)
        .map(|i| bundlesize / n + usize::from(i < bundlesize % n))
        .collect();
    // single pass moving the larger subbundles away from the low edge
    for i in 0..n - 1 {
        if n_per_subbundle[i] > n_per_subbundle[i + 1] {
            n_per_subbundle.swap(i, i + 1);
        }
    }

    let subbundles: Vec<Vec<usize>> = n_per_subbundle
        .iter()
        .scan(0, |imin, &nsub| {
            let ii: Vec<usize> = (*imin..*imin + nsub).collect();
            *imin += nsub;
            Some(ii)
        })
        .collect();

    let extract_subbundles = subbundles
        .iter()
        .map(|ii| {
            let (first, last) = (ii[0], ii[ii.len() - 1]);
            let lo = first.saturating_sub(1);
            let hi = (last + 1).min(bundlesize - 1);
            (lo..=hi).collect()
        })
        .collect();

    Ok((subbundles, extract_subbundles))
}

/// Group of contiguous spectra extracted together
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralGroup {
    /// spectra extracted in the same linear system
    pub specrange: Range<usize>,
    /// spectra of `specrange` written to the output
    pub keep: Vec<bool>,
}
impl SpectralGroup {
    /// Indices of the spectra that are written to the output
    pub fn kept(&self) -> impl Iterator<Item = usize> + '_ {
        self.specrange
            .clone()
            .zip(&self.keep)
            .filter_map(|(i, &k)| k.then_some(i))
    }
}

/// Cuts the spectra `[specmin, specmin + nspec)` into bundles of `bundlesize` spectra,
/// each of them split into `nsubbundles` overlapping groups
pub fn spectral_groups(
    specmin: usize,
    nspec: usize,
    bundlesize: usize,
    nsubbundles: usize,
) -> Result<Vec<SpectralGroup>, InputError> {
    if bundlesize == 0 {
        return Err(InputError::NotPositive("bundlesize"));
    }
    if nsubbundles == 0 {
        return Err(InputError::NoSubbundle);
    }
    let specmax = specmin + nspec;
    let mut groups = vec![];
    for bundlelo in (specmin..specmax).step_by(bundlesize) {
        let bundlehi = (bundlelo + bundlesize).min(specmax);
        let nsub = (bundlehi - bundlelo).min(nsubbundles);
        let (subbundles, extract_subbundles) = split_bundle(bundlehi - bundlelo, nsub)?;
        for (subbundle, extract) in subbundles.iter().zip(&extract_subbundles) {
            let specrange = bundlelo + extract[0]..bundlelo + extract[extract.len() - 1] + 1;
            let keep = extract.iter().map(|i| subbundle.contains(i)).collect();
            groups.push(SpectralGroup { specrange, keep });
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_10_3() {
        let (sub, ext) = split_bundle(10, 3).unwrap();
        assert_eq!(sub, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8, 9]]);
        assert_eq!(
            ext,
            vec![vec![0, 1, 2, 3], vec![2, 3, 4, 5, 6], vec![5, 6, 7, 8, 9]]
        );
    }

    #[test]
    fn split_single() {
        let (sub, ext) = split_bundle(5, 1).unwrap();
        assert_eq!(sub, vec![vec![0, 1, 2, 3, 4]]);
        assert_eq!(ext, sub);
    }

    #[test]
    fn too_many_subbundles() {
        assert_eq!(
            split_bundle(3, 4).unwrap_err(),
            InputError::TooManySubbundles {
                n: 4,
                bundlesize: 3
            }
        );
        assert_eq!(split_bundle(3, 0).unwrap_err(), InputError::NoSubbundle);
    }

    #[test]
    fn partition_properties() {
        for bundlesize in 1..=30 {
            for n in 1..=bundlesize {
                let (sub, ext) = split_bundle(bundlesize, n).unwrap();
                assert_eq!(sub.len(), n);
                let flat: Vec<usize> = sub.iter().flatten().cloned().collect();
                assert_eq!(flat, (0..bundlesize).collect::<Vec<_>>());
                let sizes: Vec<usize> = sub.iter().map(|s| s.len()).collect();
                let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
                assert!(max - min <= 1, "{bundlesize}/{n}: {sizes:?}");
                for (s, e) in sub.iter().zip(&ext) {
                    let lo = if s[0] > 0 { s[0] - 1 } else { 0 };
                    let hi = if *s.last().unwrap() < bundlesize - 1 {
                        s.last().unwrap() + 1
                    } else {
                        bundlesize - 1
                    };
                    assert_eq!(*e, (lo..=hi).collect::<Vec<_>>());
                }
            }
        }
    }

    #[test]
    fn groups_over_bundles() {
        let groups = spectral_groups(3, 7, 5, 2).unwrap();
        // bundles [3, 8) and [8, 10)
        assert_eq!(
            groups,
            vec![
                SpectralGroup {
                    specrange: 3..6,
                    keep: vec![true, true, false]
                },
                SpectralGroup {
                    specrange: 4..8,
                    keep: vec![false, true, true, true]
                },
                SpectralGroup {
                    specrange: 8..10,
                    keep: vec![true, false]
                },
                SpectralGroup {
                    specrange: 8..10,
                    keep: vec![false, true]
                },
            ]
        );
        let kept: Vec<usize> = groups.iter().flat_map(|g| g.kept()).collect();
        assert_eq!(kept, (3..10).collect::<Vec<_>>());
    }
}
