//! Pull-based row streams and the small combinator set the executor
//! needs: deferred construction, default-if-empty, and a single-producer
//! replay for memoization. Cancellation is dropping the iterator.

use crate::error::{QueryError, QueryResult};
use crate::value::Row;
use std::cell::RefCell;
use std::rc::Rc;

/// A lazy stream of rows; errors travel in-band and terminate consumers.
pub type RowStream<'a> = Box<dyn Iterator<Item = QueryResult<Row>> + 'a>;

pub fn empty<'a>() -> RowStream<'a> {
    Box::new(std::iter::empty())
}

pub fn once_err<'a>(err: QueryError) -> RowStream<'a> {
    Box::new(std::iter::once(Err(err)))
}

pub fn from_rows<'a>(rows: Vec<Row>) -> RowStream<'a> {
    Box::new(rows.into_iter().map(Ok))
}

/// Defers building the underlying stream until the first pull, so that
/// plan execution stays lazy end to end.
pub struct Lazy<'a> {
    thunk: Option<Box<dyn FnOnce() -> RowStream<'a> + 'a>>,
    inner: Option<RowStream<'a>>,
}

impl<'a> Lazy<'a> {
    pub fn stream(thunk: impl FnOnce() -> RowStream<'a> + 'a) -> RowStream<'a> {
        Box::new(Lazy {
            thunk: Some(Box::new(thunk)),
            inner: None,
        })
    }
}

impl Iterator for Lazy<'_> {
    type Item = QueryResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.inner.is_none() {
            let thunk = self.thunk.take()?;
            self.inner = Some(thunk());
        }
        self.inner.as_mut().and_then(Iterator::next)
    }
}

/// Yields the underlying items, or `fallback` once if there were none.
pub struct DefaultIfEmpty<'a> {
    inner: RowStream<'a>,
    fallback: Option<Row>,
    yielded_any: bool,
}

impl<'a> DefaultIfEmpty<'a> {
    pub fn stream(inner: RowStream<'a>, fallback: Row) -> RowStream<'a> {
        Box::new(DefaultIfEmpty {
            inner,
            fallback: Some(fallback),
            yielded_any: false,
        })
    }
}

impl Iterator for DefaultIfEmpty<'_> {
    type Item = QueryResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(item) => {
                self.yielded_any = true;
                self.fallback = None;
                Some(item)
            }
            None => {
                if self.yielded_any {
                    None
                } else {
                    self.fallback.take().map(Ok)
                }
            }
        }
    }
}

struct ReplayInner<'a> {
    source: Option<RowStream<'a>>,
    buffer: Vec<QueryResult<Row>>,
    done: bool,
}

/// Single-producer replay: the source executes once; every subscriber
/// replays the buffered items and then pulls new ones on demand.
#[derive(Clone)]
pub struct Replay<'a> {
    inner: Rc<RefCell<ReplayInner<'a>>>,
}

impl<'a> Replay<'a> {
    pub fn new(source: RowStream<'a>) -> Replay<'a> {
        Replay {
            inner: Rc::new(RefCell::new(ReplayInner {
                source: Some(source),
                buffer: Vec::new(),
                done: false,
            })),
        }
    }

    pub fn subscribe(&self) -> RowStream<'a> {
        Box::new(ReplaySubscriber {
            inner: Rc::clone(&self.inner),
            pos: 0,
        })
    }
}

struct ReplaySubscriber<'a> {
    inner: Rc<RefCell<ReplayInner<'a>>>,
    pos: usize,
}

impl Iterator for ReplaySubscriber<'_> {
    type Item = QueryResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut inner = self.inner.borrow_mut();
        if self.pos < inner.buffer.len() {
            let item = inner.buffer[self.pos].clone();
            self.pos += 1;
            return Some(item);
        }
        if inner.done {
            return None;
        }
        let pulled = inner.source.as_mut().and_then(Iterator::next);
        match pulled {
            Some(item) => {
                inner.buffer.push(item.clone());
                self.pos += 1;
                Some(item)
            }
            None => {
                inner.done = true;
                inner.source = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;

    fn row(x: i32) -> Row {
        Row::of_value(Record::from_pairs([("x", x)]))
    }

    #[test]
    fn lazy_defers_until_first_pull() {
        let built = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&built);
        let mut stream = Lazy::stream(move || {
            *flag.borrow_mut() = true;
            from_rows(vec![row(1)])
        });
        assert!(!*built.borrow());
        assert!(stream.next().is_some());
        assert!(*built.borrow());
    }

    #[test]
    fn default_if_empty_substitutes_once() {
        let s = DefaultIfEmpty::stream(empty(), row(9));
        let rows: Vec<_> = s.collect::<QueryResult<Vec<_>>>().expect("rows");
        assert_eq!(rows, vec![row(9)]);

        let s = DefaultIfEmpty::stream(from_rows(vec![row(1), row(2)]), row(9));
        let rows: Vec<_> = s.collect::<QueryResult<Vec<_>>>().expect("rows");
        assert_eq!(rows, vec![row(1), row(2)]);
    }

    #[test]
    fn replay_executes_source_once_for_all_subscribers() {
        let pulls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&pulls);
        let source = (0..3).map(move |i| {
            *counter.borrow_mut() += 1;
            Ok(row(i))
        });
        let replay = Replay::new(Box::new(source));

        let a: Vec<_> = replay
            .subscribe()
            .collect::<QueryResult<Vec<_>>>()
            .expect("a");
        let b: Vec<_> = replay
            .subscribe()
            .collect::<QueryResult<Vec<_>>>()
            .expect("b");
        assert_eq!(a, b);
        assert_eq!(*pulls.borrow(), 3);
    }

    #[test]
    fn replay_interleaves_subscribers() {
        let replay = Replay::new(from_rows(vec![row(1), row(2)]));
        let mut a = replay.subscribe();
        let mut b = replay.subscribe();
        let pull = |s: &mut RowStream<'_>| s.next().expect("item").expect("row");
        assert_eq!(pull(&mut a), row(1));
        assert_eq!(pull(&mut b), row(1));
        assert_eq!(pull(&mut b), row(2));
        assert_eq!(pull(&mut a), row(2));
        assert!(a.next().is_none());
        assert!(b.next().is_none());
    }
}
