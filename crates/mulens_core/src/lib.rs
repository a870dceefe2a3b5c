/// The `mulens_core` crate is the lens-inversion and image-tracking engine for
/// binary-lens gravitational microlensing light curves.
///
/// Key components:
/// - **Lens map**: forward map, jacobian, complex shear and its derivatives
///   for a single point mass or a (possibly orbiting) binary.
/// - **Inverse map**: Witt-Mao quintic inversion with spurious-root
///   filtering and a perturbative wide-binary fallback.
/// - **Tracker**: image-identity assignment along a source curve.
/// - **Finite source**: contour integration of the source-disk boundary
///   through the inverse map, with adaptive refinement and brute-force
///   grid fallbacks.
/// - **Trajectory driver**: samples a lens along an observer trajectory and
///   emits per-sample magnification records.
pub mod error;
pub mod finite_source;
pub mod frames;
pub mod geometry;
pub mod invmap;
pub mod lens;
pub mod magmap;
pub mod params;
pub mod roots;
pub mod tracker;
pub mod trajectory;

pub use error::{LensError, SampleStatus};
pub use geometry::Point;
pub use lens::{BinaryLens, Lens, LensAt, SingleLens};
pub use trajectory::{LinearTrajectory, Trajectory};
