//! Pollard-rho (Brent variant) integer factorization, used for the PQ step.

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 { let t = b; b = a % b; a = t; }
    a
}

fn modpow(mut n: u128, mut e: u128, m: u128) -> u128 {
    if m == 1 { return 0; }
    let mut result = 1;
    n %= m;
    while e > 0 {
        if e & 1 == 1 { result = result * n % m; }
        e >>= 1;
        n = n * n % m;
    }
    result
}

fn abs_sub(a: u128, b: u128) -> u128 { a.max(b) - a.min(b) }

// Upper bound on backtracking steps once the batched gcd overshoots.
const MAX_BACKTRACK: usize = 1 << 20;

fn factorize_with(pq: u128, c: u128) -> Option<(u64, u64)> {
    if pq % 2 == 0 { return Some((2, (pq / 2) as u64)); }

    let mut y = 3 * (pq / 7);
    let m = 7 * (pq / 13);
    let mut g = 1u128;
    let mut r = 1u128;
    let mut q = 1u128;
    let mut x = 0u128;
    let mut ys = 0u128;

    while g == 1 {
        x = y;
        for _ in 0..r { y = (modpow(y, 2, pq) + c) % pq; }
        let mut k = 0;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..m.min(r - k) {
                y = (modpow(y, 2, pq) + c) % pq;
                q = q * abs_sub(x, y) % pq;
            }
            g = gcd(q, pq);
            k += m;
        }
        r *= 2;
    }

    if g == pq {
        g = 1;
        for _ in 0..MAX_BACKTRACK {
            ys = (modpow(ys, 2, pq) + c) % pq;
            g = gcd(abs_sub(x, ys), pq);
            if g > 1 { break; }
        }
    }

    if g <= 1 || g >= pq { return None; }
    let p = g as u64;
    let q = (pq / g) as u64;
    Some((p.min(q), p.max(q)))
}

/// Factorize `pq` into two factors `(p, q)` where `p ≤ q`.
///
/// Returns `None` for values below 4 and for primes, or if no attempt
/// converged.
pub fn factorize(pq: u64) -> Option<(u64, u64)> {
    if pq < 4 { return None; }
    let n = pq as u128;
    for attempt in [43u128, 47, 53, 59, 61] {
        let c = attempt * (n / 103);
        if let Some(found) = factorize_with(n, c) {
            return Some(found);
        }
    }
    None
}
