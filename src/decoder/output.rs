//! Output path policy.
//!
//! Decided once at decoder construction and never mutated: each decoded
//! picture is either consumed directly in optimal layout, or copied to a
//! linearly addressable image for external consumers. Routing itself never
//! fails; failures surface from the copy step it selects.

/// Where a decoded picture goes after the hardware finishes with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRoute {
    /// The frame buffer consumes the decode target directly.
    Optimal,
    /// The picture is copied to a linear image before being signalled
    /// available.
    Linear,
}

/// Immutable per-picture output routing policy.
#[derive(Debug, Clone, Copy)]
pub struct OutputPathSelector {
    use_separate_output_images: bool,
    use_linear_output: bool,
}

impl OutputPathSelector {
    /// Build the policy from the construction-time flags.
    pub fn new(use_separate_output_images: bool, use_linear_output: bool) -> Self {
        Self {
            use_separate_output_images,
            use_linear_output,
        }
    }

    /// Route a decoded picture.
    pub fn route(&self) -> OutputRoute {
        if self.use_linear_output {
            OutputRoute::Linear
        } else {
            OutputRoute::Optimal
        }
    }

    /// Whether decode output images are distinct from the DPB.
    pub fn separate_output_images(&self) -> bool {
        self.use_separate_output_images || self.use_linear_output
    }

    /// Whether the linear copy step runs for decoded pictures.
    pub fn linear_output(&self) -> bool {
        self.use_linear_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes_optimal() {
        let selector = OutputPathSelector::new(false, false);
        assert_eq!(selector.route(), OutputRoute::Optimal);
        assert!(!selector.linear_output());
    }

    #[test]
    fn test_linear_flag_routes_linear() {
        let selector = OutputPathSelector::new(false, true);
        assert_eq!(selector.route(), OutputRoute::Linear);
    }

    #[test]
    fn test_linear_output_implies_separate_images() {
        let selector = OutputPathSelector::new(false, true);
        assert!(selector.separate_output_images());
    }

    #[test]
    fn test_separate_images_without_linear_stays_optimal() {
        let selector = OutputPathSelector::new(true, false);
        assert_eq!(selector.route(), OutputRoute::Optimal);
        assert!(selector.separate_output_images());
    }

    #[test]
    fn test_routing_is_stable_across_pictures() {
        let selector = OutputPathSelector::new(false, false);
        for _ in 0..100 {
            assert_eq!(selector.route(), OutputRoute::Optimal);
        }
    }
}
