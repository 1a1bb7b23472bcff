use rand::{Rng, RngCore};
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u32() -> u32;
    fn gen_i32_range(range: Range<i32>) -> i32;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::thread_rng().next_u32()
    }

    fn gen_i32_range(range: Range<i32>) -> i32 {
        rand::thread_rng().gen_range(range)
    }
}

/// challenge values are positive 31 bit numbers
pub fn new_challenge<R: Random>() -> i32 {
    (R::next_u32() & 0x7fff_ffff) as i32
}
