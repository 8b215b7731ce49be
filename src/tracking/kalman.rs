// src/tracking/kalman.rs
//
// Constant-velocity Kalman filter over ball position. State is
// [x, y, vx, vy]; only position is measured. One predict/update cycle
// per frame, dt fixed at one frame interval.

use crate::types::Point;
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};

pub struct PositionFilter {
    state: Vector4<f64>,
    covariance: Matrix4<f64>,
    transition: Matrix4<f64>,
    observation: Matrix2x4<f64>,
    process_noise: Matrix4<f64>,
    measurement_noise: Matrix2<f64>,
}

impl PositionFilter {
    pub fn new(initial: Point, process_noise: f64, measurement_noise: f64) -> Self {
        let state = Vector4::new(initial.x, initial.y, 0.0, 0.0);

        #[rustfmt::skip]
        let transition = Matrix4::new(
            1.0, 0.0, 1.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        #[rustfmt::skip]
        let observation = Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );

        Self {
            state,
            // High initial uncertainty so the first measurements dominate.
            covariance: Matrix4::identity() * 1000.0,
            transition,
            observation,
            process_noise: Matrix4::identity() * process_noise,
            measurement_noise: Matrix2::identity() * measurement_noise,
        }
    }

    /// Predict the state one frame ahead: x' = F x, P' = F P F^T + Q.
    pub fn predict(&mut self) -> Point {
        self.state = self.transition * self.state;
        self.covariance =
            self.transition * self.covariance * self.transition.transpose() + self.process_noise;
        self.position()
    }

    /// Fold in a position measurement and return the corrected position.
    pub fn update(&mut self, measurement: Point) -> Point {
        let z = Vector2::new(measurement.x, measurement.y);
        let innovation = z - self.observation * self.state;

        let s = self.observation * self.covariance * self.observation.transpose()
            + self.measurement_noise;
        let Some(s_inv) = s.try_inverse() else {
            // Singular innovation covariance; skip the correction rather
            // than poison the state with NaNs.
            return self.position();
        };

        let gain: Matrix4x2<f64> = self.covariance * self.observation.transpose() * s_inv;
        self.state += gain * innovation;
        self.covariance =
            (Matrix4::identity() - gain * self.observation) * self.covariance;

        self.position()
    }

    pub fn position(&self) -> Point {
        Point::new(self.state[0], self.state[1])
    }

    pub fn velocity(&self) -> Point {
        Point::new(self.state[2], self.state[3])
    }
}
