use glam::{Vec3, Vec4};

/// Vertex of the transparent draw list, in eye space.
/// Matches the vertex layout of the engine's WGSL programs.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, Debug, PartialEq)]
pub struct SceneVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    /// Straight alpha rgba.
    pub color: [f32; 4],
}

impl SceneVertex {
    pub fn new(position: Vec3, normal: Vec3, color: Vec4) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            color: color.to_array(),
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn normal(&self) -> Vec3 {
        Vec3::from_array(self.normal)
    }

    pub fn color(&self) -> Vec4 {
        Vec4::from_array(self.color)
    }
}

/// Eye space axis-aligned bounding box of a draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_vertices(vertices: &[SceneVertex]) -> Option<Self> {
        let mut positions = vertices.iter().map(SceneVertex::position);
        let first = positions.next()?;
        Some(positions.fold(Self::new(first, first), |aabb, p| {
            Self::new(aabb.min.min(p), aabb.max.max(p))
        }))
    }

    /// Triangle list of the box faces.
    pub fn triangles(&self) -> Vec<SceneVertex> {
        let (lo, hi) = (self.min, self.max);
        let corner = |x: bool, y: bool, z: bool| {
            Vec3::new(
                if x { hi.x } else { lo.x },
                if y { hi.y } else { lo.y },
                if z { hi.z } else { lo.z },
            )
        };
        // (normal, four corners in fan order)
        let faces = [
            (Vec3::X, [corner(true, false, false), corner(true, true, false), corner(true, true, true), corner(true, false, true)]),
            (Vec3::NEG_X, [corner(false, false, false), corner(false, false, true), corner(false, true, true), corner(false, true, false)]),
            (Vec3::Y, [corner(false, true, false), corner(false, true, true), corner(true, true, true), corner(true, true, false)]),
            (Vec3::NEG_Y, [corner(false, false, false), corner(true, false, false), corner(true, false, true), corner(false, false, true)]),
            (Vec3::Z, [corner(false, false, true), corner(true, false, true), corner(true, true, true), corner(false, true, true)]),
            (Vec3::NEG_Z, [corner(false, false, false), corner(false, true, false), corner(true, true, false), corner(true, false, false)]),
        ];
        faces
            .iter()
            .flat_map(|(normal, quad)| {
                [quad[0], quad[1], quad[2], quad[0], quad[2], quad[3]]
                    .map(|p| SceneVertex::new(p, *normal, Vec4::ONE))
            })
            .collect()
    }
}

/// Two triangles covering an eye space rectangle facing the camera at depth
/// `-distance`.
pub fn quad(min: [f32; 2], max: [f32; 2], distance: f32, color: Vec4) -> Vec<SceneVertex> {
    let z = -distance;
    let corners = [
        Vec3::new(min[0], min[1], z),
        Vec3::new(max[0], min[1], z),
        Vec3::new(max[0], max[1], z),
        Vec3::new(min[0], max[1], z),
    ];
    [0, 1, 2, 0, 2, 3]
        .iter()
        .map(|&i| SceneVertex::new(corners[i], Vec3::Z, color))
        .collect()
}
