//! Process-level physical constants.

use armature_math::{Twist, fph};
use nalgebra::vector;

/// Physical constants shared by every entity of a model.
#[derive(Clone, Debug, PartialEq)]
pub struct Environment {
    gravity: Twist,
}

impl Environment {
    /// Standard gravity: 9.8 m/s² along negative world y.
    pub fn new() -> Self {
        Self {
            gravity: vector![0.0, 0.0, 0.0, 0.0, -9.8, 0.0],
        }
    }

    /// The gravitational spatial acceleration of the world frame.
    pub fn gravity(&self) -> &Twist {
        &self.gravity
    }

    pub fn set_gravity(&mut self, gravity: Twist) {
        self.gravity = gravity;
    }

    /// Convenience accessor for the linear gravity component.
    pub fn set_linear_gravity(&mut self, x: fph, y: fph, z: fph) {
        self.gravity = vector![0.0, 0.0, 0.0, x, y, z];
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
