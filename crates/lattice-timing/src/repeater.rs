use crate::Micros;

/// Interval gate for work that should run at most once per period.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Repeater {
    interval: Micros,
    last_acted: Micros,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Micros) -> Self {
        Self { interval, last_acted: Micros::ZERO }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        self.fired_at(Micros::now())
    }

    /// Explicit-clock variant so ticks stay deterministic under test.
    #[inline]
    pub fn fired_at(&mut self, now: Micros) -> bool {
        if now.elapsed_since(self.last_acted) >= self.interval {
            self.last_acted = now;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Micros {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Micros) {
        self.interval = interval
    }

    pub fn reset(&mut self) {
        self.last_acted = Micros::now()
    }

    pub fn force_fire(&mut self) {
        self.last_acted = Micros::ZERO
    }
}
