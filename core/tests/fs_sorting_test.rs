use std::cmp::Ordering;

use aw_man_core::fs::{NaturalSorter, natural_cmp};

/// Canonical ordering of the mixed-case numeric sample.
const SAMPLE: &[&str] =
    &["z1.doc", "z4.5.doc", "z4.7.doc", "z4.75.doc", "z9.doc", "z10.doc", "Z20.doc"];

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut all = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, item.clone());
            all.push(tail);
        }
    }
    all
}

#[test]
fn every_permutation_sorts_to_the_canonical_order() {
    for mut permutation in permutations(SAMPLE) {
        let mut sorter = NaturalSorter::new();
        permutation.sort_by(|a, b| sorter.compare(a, b));
        assert_eq!(permutation, SAMPLE, "permutation did not sort canonically");
    }
}

#[test]
fn fractional_chapter_numbers_sort_between_integers() {
    assert_eq!(natural_cmp("16:", "16.5:"), Ordering::Less);
    assert_eq!(natural_cmp("16.5:", "17:"), Ordering::Less);

    let mut chapters = vec!["Ch. 10.5", "Ch. 1", "Ch. 10"];
    chapters.sort_by(|a, b| natural_cmp(a, b));
    assert_eq!(chapters, vec!["Ch. 1", "Ch. 10", "Ch. 10.5"]);
}

#[test]
fn kelvin_sign_compares_equal_to_latin_k() {
    assert_eq!(natural_cmp("K", "\u{212A}"), Ordering::Equal);
    assert_eq!(natural_cmp("2\u{212A}", "2K"), Ordering::Equal);
}

#[test]
fn memoized_and_one_off_comparisons_agree() {
    let mut sorter = NaturalSorter::new();
    for a in SAMPLE {
        for b in SAMPLE {
            assert_eq!(sorter.compare(a, b), natural_cmp(a, b), "{a} vs {b}");
        }
    }
}
