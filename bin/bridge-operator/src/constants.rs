/// Events buffered between the sources and the driver.
pub(crate) const EVENT_QUEUE_SIZE: usize = 256;
