//! Deadline-aware yielding.

use crate::port::{Hardware, Port, Scheduler};
use crate::time::Deadline;

/// Yields to other work until some time before `deadline`.
///
/// For callers with nothing useful to do until `deadline`. This is a hint:
/// the caller may resume at any point up to `deadline`. With an active
/// scheduler the running task gives up the processor. Without one, or for a
/// deadline that has already passed, this returns immediately and the caller
/// keeps polling.
///
/// Must not be called with a spinlock held.
pub fn yield_until_before<P: Port + ?Sized>(port: &P, deadline: Deadline) {
    if !port.presence().is_active() {
        return;
    }
    if deadline.is_reached(port.hardware().now()) {
        return;
    }
    port.scheduler().yield_until_before(deadline);
}

#[cfg(all(not(loom), test))]
mod test {
    use super::yield_until_before;
    use crate::test::{Call, Forbidden, Recording, StubHardware, TestPort};
    use crate::time::{sleep_until, Instant};

    #[test]
    fn degraded_is_a_no_op() {
        let port = TestPort::new(StubHardware::on_core(0), Forbidden);
        yield_until_before(&port, Instant::from_micros(1_000));
    }

    #[test]
    fn past_deadline_returns_immediately() {
        let port = TestPort::new(StubHardware::on_core(0), Forbidden);
        port.presence.activate();
        port.hardware.set_now(Instant::from_micros(1_000));
        yield_until_before(&port, Instant::from_micros(10));
        yield_until_before(&port, Instant::from_micros(1_000));
    }

    #[test]
    fn active_yields_to_scheduler() {
        let port = TestPort::new(StubHardware::on_core(0), Recording::new(4));
        port.presence.activate();
        let deadline = Instant::from_micros(1_000);
        yield_until_before(&port, deadline);
        assert_eq!(port.scheduler.calls(), [Call::Yield]);
    }

    #[test]
    fn sleep_until_yields_until_reached() {
        let port = TestPort::new(StubHardware::on_core(0), Recording::new(4));
        port.presence.activate();
        port.hardware.set_step(10);
        // Reads: 0 (sleep), 10 (yield), 20 (sleep), 30 (yield), 40 (sleep).
        sleep_until(&port, Instant::from_micros(35));
        assert_eq!(port.scheduler.calls(), [Call::Yield, Call::Yield]);
    }

    #[test]
    fn sleep_until_degraded_busy_waits() {
        let port = TestPort::new(StubHardware::on_core(0), Forbidden);
        port.hardware.set_step(5);
        sleep_until(&port, Instant::from_micros(20));
        assert!(Instant::from_micros(20).is_reached(port.hardware.peek()));
    }
}
