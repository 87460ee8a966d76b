use crate::result::Result;
use bstr::BStr;

/// Byte pipe to one physical device.
///
/// Implementations are not reentrant: a session hands the transport to
/// exactly one of the control path or the reader task at a time.
pub trait Transport: Send {
    /// Sends `command` and fills `reply` with the device's response.
    fn send(&mut self, command: &[u8], reply: &mut [u8]) -> Result<()>;

    /// Reads image data into `buf`, returning the byte count delivered.
    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Opens transports for devices attached under a name.
pub trait TransportOpener: Send + Sync {
    fn open(&self, name: &BStr) -> Result<Box<dyn Transport>>;
}

impl<F> TransportOpener for F
where
    F: Fn(&BStr) -> Result<Box<dyn Transport>> + Send + Sync,
{
    fn open(&self, name: &BStr) -> Result<Box<dyn Transport>> {
        self(name)
    }
}
