use bitflags::bitflags;
use std::time::{Duration, Instant};

use crate::events::{Event, TabEvent};

bitflags! {
    /// Dashboard panels that need re-rendering
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags: u32 {
        const NONE = 0;
        /// Search dropdown (placeholder, results, highlight)
        const SEARCH = 0b0000_0001;
        /// Streaming analysis output panel
        const ANALYSIS = 0b0000_0010;
        /// Analysis history list
        const HISTORY = 0b0000_0100;
        /// Body of the active tab
        const TAB = 0b0000_1000;
        /// Loading placeholders
        const LOADING = 0b0001_0000;
        /// Error banner / retry affordance
        const ERROR = 0b0010_0000;
        /// Header showing the active entity and tab
        const HEADER = 0b0100_0000;
        const ALL = 0xFFFF_FFFF;
    }
}

impl DirtyFlags {
    #[inline]
    pub fn needs_render(self) -> bool {
        !self.is_empty()
    }

    /// Panels touched by one orchestrator event
    #[must_use]
    pub fn for_event(event: &Event) -> Self {
        match event {
            Event::Search(snapshot) => {
                let mut flags = Self::SEARCH;
                if snapshot.status.is_failed() {
                    flags.insert(Self::ERROR);
                }
                flags
            }
            Event::Run(run) => {
                let mut flags = Self::ANALYSIS;
                if run.error.is_some() {
                    flags.insert(Self::ERROR);
                }
                if run.state.is_terminal() {
                    // a completed run invalidates the history list
                    flags.insert(Self::HISTORY);
                }
                flags
            }
            Event::Tab(TabEvent::Loading { .. }) => Self::TAB | Self::LOADING,
            Event::Tab(TabEvent::Ready(_)) => Self::TAB,
            Event::Tab(TabEvent::Failed { .. }) => Self::TAB | Self::ERROR,
            Event::History { .. } => Self::HISTORY,
            Event::Session(_) => Self::ALL,
        }
    }
}

/// Coalesces events between two renders
#[derive(Debug)]
pub struct RenderState {
    dirty: DirtyFlags,
    last_render: Instant,
    render_count: u64,
    skip_count: u64,
}

impl Default for RenderState {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderState {
    pub fn new() -> Self {
        Self {
            dirty: DirtyFlags::NONE,
            last_render: Instant::now(),
            render_count: 0,
            skip_count: 0,
        }
    }

    #[inline]
    pub fn needs_render(&self) -> bool {
        self.dirty.needs_render()
    }

    #[inline]
    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty.insert(flags);
    }

    #[inline]
    pub fn observe(&mut self, event: &Event) {
        self.mark_dirty(DirtyFlags::for_event(event));
    }

    /// Take the pending flags; counts a render if anything was dirty, a skip otherwise
    pub fn take(&mut self) -> DirtyFlags {
        let dirty = std::mem::replace(&mut self.dirty, DirtyFlags::NONE);
        if dirty.needs_render() {
            self.last_render = Instant::now();
            self.render_count += 1;
        } else {
            self.skip_count += 1;
        }
        dirty
    }

    #[inline]
    pub fn time_since_last_render(&self) -> Duration {
        self.last_render.elapsed()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn efficiency(&self) -> f64 {
        let total = self.render_count + self.skip_count;
        if total == 0 {
            0.0
        } else {
            (self.skip_count as f64 / total as f64) * 100.0
        }
    }

    pub fn stats(&self) -> String {
        format!(
            "渲染次数: {}, 跳过次数: {}, 跳过率: {:.1}%",
            self.render_count,
            self.skip_count,
            self.efficiency()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{DirtyFlags, RenderState};
    use crate::events::Event;
    use crate::model::SessionState;

    #[test]
    fn session_change_redraws_everything() {
        let flags = DirtyFlags::for_event(&Event::Session(SessionState::default()));
        assert_eq!(flags, DirtyFlags::ALL);
    }

    #[test]
    fn take_clears_and_counts() {
        let mut state = RenderState::new();
        assert!(!state.needs_render());

        state.mark_dirty(DirtyFlags::SEARCH | DirtyFlags::ERROR);
        assert!(state.needs_render());
        let flags = state.take();
        assert!(flags.contains(DirtyFlags::SEARCH));
        assert!(flags.contains(DirtyFlags::ERROR));
        assert!(!state.needs_render());

        assert_eq!(state.take(), DirtyFlags::NONE);
        assert_eq!(state.render_count, 1);
        assert_eq!(state.skip_count, 1);
        assert!((state.efficiency() - 50.0).abs() < f64::EPSILON);
    }
}
