/// Associates readiness events with their connection record.
///
/// A `Token` is the index of a [`Connection`] in the [`Pool`]; it is stored
/// in the kernel registration so that every readiness event names the record
/// it belongs to. Tokens are stable for the lifetime of the pool and are
/// reused when a record is freed and re-acquired.
///
/// [`Connection`]: crate::Connection
/// [`Pool`]: crate::Pool
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
