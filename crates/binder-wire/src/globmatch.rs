//! Single-wildcard glob matching used to test a verb/API name against
//! a stub's permitted-name list (`spec.md` §4.7.4). `*` is the only
//! wildcard; a match returns a score (length of the matched literal
//! prefix/suffix) rather than a bare boolean, so callers can prefer
//! the most specific of several matching patterns.

const GLOB: u8 = b'*';

fn eq(fold_case: bool, a: u8, b: u8) -> bool {
    if fold_case {
        a.to_ascii_lowercase() == b.to_ascii_lowercase()
    } else {
        a == b
    }
}

fn match_from(pat: &[u8], str_: &[u8], fold_case: bool) -> u32 {
    let mut pat = pat;
    let mut str_ = str_;
    let mut r = 1u32;

    loop {
        let (c, rest) = match pat.split_first() {
            Some((&c, rest)) => (c, rest),
            None => return 0,
        };
        if c == GLOB {
            pat = rest;
            break;
        }
        let (x, srest) = match str_.split_first() {
            Some((&x, srest)) => (x, srest),
            None => return 0,
        };
        if !eq(fold_case, c, x) {
            return 0;
        }
        str_ = srest;
        r += 1;
    }

    if pat.is_empty() {
        return r;
    }

    let c = pat[0];
    let tail = &pat[1..];
    let mut best = 0u32;
    let mut rest = str_;
    while let Some((&x, after)) = rest.split_first() {
        if eq(fold_case, c, x) {
            let rr = match_from(tail, after, fold_case);
            if rr > best {
                best = rr;
            }
        }
        rest = after;
    }
    if best == 0 {
        0
    } else {
        best + r
    }
}

/// Returns a non-zero score if `name` matches `pattern`, 0 otherwise.
#[must_use]
pub fn globmatch(pattern: &str, name: &str) -> u32 {
    match_from(pattern.as_bytes(), name.as_bytes(), false)
}

/// Case-insensitive variant of [`globmatch`].
#[must_use]
pub fn globmatchi(pattern: &str, name: &str) -> u32 {
    match_from(pattern.as_bytes(), name.as_bytes(), true)
}
