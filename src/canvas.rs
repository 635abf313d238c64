/// The shared pixel grid. Written only from the Raft apply path; readers take
/// whole-grid snapshots and accept a possibly-stale view.
pub struct Canvas {
    size: u32,
    grid: Vec<u32>, // row-major, grid[y * size + x]
    on_update: Option<Box<dyn Fn(u32, u32, u32) + Send + Sync>>,
}

impl Canvas {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            grid: vec![0; (size * size) as usize],
            on_update: None,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Register the single subscriber hook fired on every applied pixel.
    /// The hook runs on the apply path and must not block.
    pub fn set_on_update(&mut self, hook: impl Fn(u32, u32, u32) + Send + Sync + 'static) {
        self.on_update = Some(Box::new(hook));
    }

    pub fn in_bounds(&self, x: u32, y: u32) -> bool {
        x < self.size && y < self.size
    }

    pub fn update(&mut self, x: u32, y: u32, color: u32) {
        self.grid[(y * self.size + x) as usize] = color;
        if let Some(hook) = &self.on_update {
            hook(x, y, color);
        }
    }

    pub fn get(&self, x: u32, y: u32) -> u32 {
        self.grid[(y * self.size + x) as usize]
    }

    /// Row-major copy of the whole grid.
    pub fn all_pixels(&self) -> Vec<u32> {
        self.grid.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn update_writes_row_major() {
        let mut canvas = Canvas::new(4);
        canvas.update(3, 1, 0x00FF00);
        assert_eq!(canvas.get(3, 1), 0x00FF00);
        let pixels = canvas.all_pixels();
        assert_eq!(pixels.len(), 16);
        assert_eq!(pixels[1 * 4 + 3], 0x00FF00);
    }

    #[test]
    fn update_fires_hook() {
        let seen = Arc::new(AtomicU32::new(0));
        let hook_seen = Arc::clone(&seen);
        let mut canvas = Canvas::new(8);
        canvas.set_on_update(move |_, _, color| {
            hook_seen.store(color, Ordering::SeqCst);
        });
        canvas.update(0, 0, 0xABCDEF);
        assert_eq!(seen.load(Ordering::SeqCst), 0xABCDEF);
    }

    #[test]
    fn bounds_check() {
        let canvas = Canvas::new(2);
        assert!(canvas.in_bounds(1, 1));
        assert!(!canvas.in_bounds(2, 0));
        assert!(!canvas.in_bounds(0, 2));
    }
}
