/// Vertical extent of a rendered element, in rows relative to the top of the
/// viewport. Negative values lie above the visible area.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Bounds {
    pub top: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(top: i32, height: i32) -> Self {
        Self {
            top,
            bottom: top + height.max(0),
        }
    }
}

pub trait LayoutProbe {
    fn active_block_bounds(&self) -> Option<Bounds>;
    fn viewport_height(&self) -> i32;
    fn has_raw_text_input(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FocusRequest {
    ActiveBlock(usize),
    RawTextInput,
    None,
}

pub fn is_in_viewport(bounds: Bounds, viewport_height: i32) -> bool {
    bounds.bottom >= 0 && bounds.top < viewport_height
}

pub fn decide_focus(active_index: Option<usize>, layout: &impl LayoutProbe) -> FocusRequest {
    if let Some(index) = active_index
        && let Some(bounds) = layout.active_block_bounds()
        && is_in_viewport(bounds, layout.viewport_height())
    {
        return FocusRequest::ActiveBlock(index);
    }

    if layout.has_raw_text_input() {
        FocusRequest::RawTextInput
    } else {
        FocusRequest::None
    }
}

#[cfg(test)]
mod tests {
    use super::{Bounds, FocusRequest, LayoutProbe, decide_focus, is_in_viewport};

    struct FixedLayout {
        active: Option<Bounds>,
        height: i32,
        raw_input: bool,
    }

    impl LayoutProbe for FixedLayout {
        fn active_block_bounds(&self) -> Option<Bounds> {
            self.active
        }

        fn viewport_height(&self) -> i32 {
            self.height
        }

        fn has_raw_text_input(&self) -> bool {
            self.raw_input
        }
    }

    #[test]
    fn partially_visible_elements_count_as_visible() {
        assert!(is_in_viewport(Bounds::new(-3, 4), 20));
        assert!(is_in_viewport(Bounds::new(19, 5), 20));
        assert!(is_in_viewport(Bounds { top: -2, bottom: 0 }, 20));
    }

    #[test]
    fn elements_outside_the_range_are_hidden() {
        assert!(!is_in_viewport(Bounds::new(-5, 2), 20));
        assert!(!is_in_viewport(Bounds::new(20, 3), 20));
    }

    #[test]
    fn focus_prefers_visible_active_block() {
        let layout = FixedLayout {
            active: Some(Bounds::new(4, 2)),
            height: 20,
            raw_input: true,
        };
        assert_eq!(decide_focus(Some(3), &layout), FocusRequest::ActiveBlock(3));
    }

    #[test]
    fn focus_falls_back_to_raw_input_when_block_is_off_screen() {
        let layout = FixedLayout {
            active: Some(Bounds::new(40, 2)),
            height: 20,
            raw_input: true,
        };
        assert_eq!(decide_focus(Some(3), &layout), FocusRequest::RawTextInput);
    }

    #[test]
    fn missing_targets_drop_the_request() {
        let layout = FixedLayout {
            active: None,
            height: 20,
            raw_input: false,
        };
        assert_eq!(decide_focus(None, &layout), FocusRequest::None);
    }
}
