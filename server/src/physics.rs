///Represents a vector in 2D space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector2 {
    ///Value along the x-axis.
    /// Positive direction is to the right.
    pub x: f32,
    ///Value along the y-axis.
    /// Positive direction is up.
    pub y: f32,
}

impl Vector2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    ///Returns the magnitude of the vector.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    ///Returns the normalized vector.
    pub fn normalize(&self) -> Vector2 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vector2 { x: 0.0, y: 0.0 }
        } else {
            Vector2 {
                x: self.x / mag,
                y: self.y / mag,
            }
        }
    }

    ///Returns the scaled vector.
    pub fn scale(&self, scalar: f32) -> Vector2 {
        Vector2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    ///Returns the sum of two vectors.
    pub fn add(&self, other: &Vector2) -> Vector2 {
        Vector2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    pub fn distance(&self, other: &Vector2) -> f32 {
        Vector2::new(other.x - self.x, other.y - self.y).magnitude()
    }
}

///A moving disc on the board, pushed around by a held-key force.
#[derive(Debug, Clone, Copy)]
pub struct Body {
    ///The positional center of the body.
    pub position: Vector2,
    pub velocity: Vector2,
    pub radius: f32,
    pub max_speed: f32,
    ///Fraction of velocity kept per second when no force is applied.
    pub damping: f32,
}

impl Body {
    pub fn at(position: Vector2, radius: f32) -> Self {
        Self {
            position,
            velocity: Vector2::default(),
            radius,
            max_speed: 12.0,
            damping: 0.05,
        }
    }

    ///Integrates one step of `dt` seconds under `force`.
    pub fn simulate(&mut self, force: Vector2, dt: f32) {
        self.velocity = self.velocity.add(&force.scale(dt));
        self.velocity = self.velocity.scale(self.damping.powf(dt));

        // Clamp velocity to max_speed
        let speed = self.velocity.magnitude();
        if speed > self.max_speed {
            self.velocity = self.velocity.normalize().scale(self.max_speed);
        }

        self.position = self.position.add(&self.velocity.scale(dt));
    }

    ///Keeps the body inside a board centered on the origin, stopping
    ///movement along any axis that hits an edge.
    pub fn clamp_to(&mut self, half_width: f32, half_height: f32) {
        let max_x = half_width - self.radius;
        let max_y = half_height - self.radius;

        if self.position.x.abs() > max_x {
            self.position.x = self.position.x.clamp(-max_x, max_x);
            self.velocity.x = 0.0;
        }
        if self.position.y.abs() > max_y {
            self.position.y = self.position.y.clamp(-max_y, max_y);
            self.velocity.y = 0.0;
        }
    }

    pub fn touches(&self, point: &Vector2, radius: f32) -> bool {
        self.position.distance(point) < self.radius + radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_normalize_zero_vector() {
        assert_eq!(Vector2::default().normalize(), Vector2::default());
        assert_approx_eq!(Vector2::new(3.0, 4.0).normalize().magnitude(), 1.0);
    }

    #[test]
    fn test_force_moves_body() {
        let mut body = Body::at(Vector2::default(), 0.5);
        body.simulate(Vector2::new(10.0, 0.0), 0.1);
        assert!(body.velocity.x > 0.0);
        assert!(body.position.x > 0.0);
        assert_approx_eq!(body.position.y, 0.0);
    }

    #[test]
    fn test_speed_is_clamped() {
        let mut body = Body::at(Vector2::default(), 0.5);
        body.damping = 1.0;
        body.simulate(Vector2::new(0.0, 10_000.0), 1.0);
        assert_approx_eq!(body.velocity.magnitude(), body.max_speed, 1e-3);
    }

    #[test]
    fn test_damping_slows_idle_body() {
        let mut body = Body::at(Vector2::default(), 0.5);
        body.velocity = Vector2::new(4.0, 0.0);
        body.simulate(Vector2::default(), 0.5);
        assert!(body.velocity.x < 4.0);
        assert!(body.velocity.x > 0.0);
    }

    #[test]
    fn test_clamp_stops_at_edge() {
        let mut body = Body::at(Vector2::new(50.0, -50.0), 1.0);
        body.velocity = Vector2::new(3.0, -3.0);
        body.clamp_to(10.0, 10.0);
        assert_approx_eq!(body.position.x, 9.0);
        assert_approx_eq!(body.position.y, -9.0);
        assert_eq!(body.velocity, Vector2::default());
    }

    #[test]
    fn test_touches() {
        let body = Body::at(Vector2::default(), 1.0);
        assert!(body.touches(&Vector2::new(1.5, 0.0), 1.0));
        assert!(!body.touches(&Vector2::new(3.0, 0.0), 0.5));
    }
}
