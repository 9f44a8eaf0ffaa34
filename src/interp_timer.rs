//! Periodic timer driving wavetable interpolation updates.
//!
//! The loader only touches flash while the timer is running. Flash erase and
//! write operations pause the timer for their whole duration by holding a
//! `TimerPause` guard, which resumes the timer when dropped. Pauses nest.

use crossbeam::atomic::AtomicCell;
use log::debug;

pub struct InterpTimer {
    pause_depth: AtomicCell<usize>,
}

impl Default for InterpTimer {
    fn default() -> Self {
        InterpTimer::new()
    }
}

impl InterpTimer {
    pub fn new() -> InterpTimer {
        InterpTimer{pause_depth: AtomicCell::new(0)}
    }

    pub fn is_running(&self) -> bool {
        self.pause_depth.load() == 0
    }

    /// Stop the timer until the returned guard is dropped.
    ///
    /// ```
    /// use wavesphere::InterpTimer;
    ///
    /// let timer = InterpTimer::new();
    /// {
    ///     let _pause = timer.pause();
    ///     assert!(!timer.is_running());
    /// }
    /// assert!(timer.is_running());
    /// ```
    pub fn pause(&self) -> TimerPause<'_> {
        let depth = self.pause_depth.fetch_add(1);
        if depth == 0 {
            debug!("Interpolation timer stopped");
        }
        TimerPause{timer: self}
    }

    fn resume(&self) {
        let depth = self.pause_depth.fetch_sub(1);
        if depth == 1 {
            debug!("Interpolation timer started");
        }
    }
}

/// Keeps the timer stopped while alive.
pub struct TimerPause<'a> {
    timer: &'a InterpTimer,
}

impl<'a> Drop for TimerPause<'a> {
    fn drop(&mut self) {
        self.timer.resume();
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[test]
fn pauses_nest() {
    let timer = InterpTimer::new();
    let outer = timer.pause();
    {
        let _inner = timer.pause();
        assert!(!timer.is_running());
    }
    assert!(!timer.is_running());
    drop(outer);
    assert!(timer.is_running());
}

#[test]
fn pause_is_released_on_early_return() {
    fn failing_write(timer: &InterpTimer) -> Result<(), ()> {
        let _pause = timer.pause();
        Err(())
    }
    let timer = InterpTimer::new();
    assert!(failing_write(&timer).is_err());
    assert!(timer.is_running());
}
