// Pull-based row reader contract shared by every stage.
use crate::core::error::Error;

/// A forward-only source of rows.
///
/// `read` returns `Ok(None)` once the source is exhausted and keeps returning it on
/// every later call. `close` releases held resources and is a no-op when repeated.
pub trait RowReader {
    type Row;

    fn header(&self) -> Option<&[String]>;

    fn read(&mut self) -> Result<Option<Self::Row>, Error>;

    fn close(&mut self) -> Result<(), Error>;
}

impl<R: RowReader + ?Sized> RowReader for Box<R> {
    type Row = R::Row;

    fn header(&self) -> Option<&[String]> {
        (**self).header()
    }

    fn read(&mut self) -> Result<Option<Self::Row>, Error> {
        (**self).read()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}
