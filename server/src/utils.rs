use shared::Color;
use std::sync::atomic::{AtomicUsize, Ordering};

const PALETTE: [Color; 8] = [
    Color::new(66, 135, 245),
    Color::new(235, 64, 52),
    Color::new(67, 181, 90),
    Color::new(153, 89, 204),
    Color::new(245, 155, 45),
    Color::new(45, 205, 215),
    Color::new(222, 70, 190),
    Color::new(240, 220, 60),
];

// Hands out player colors round-robin across authenticated connections
#[derive(Debug, Default)]
pub struct ColorPicker {
    next: AtomicUsize,
}

impl ColorPicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_color(&self) -> Color {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        PALETTE[index % PALETTE.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colors_cycle_through_palette() {
        let picker = ColorPicker::new();
        let first: Vec<Color> = (0..PALETTE.len()).map(|_| picker.next_color()).collect();
        assert_eq!(first, PALETTE.to_vec());
        assert_eq!(picker.next_color(), PALETTE[0]);
    }
}
