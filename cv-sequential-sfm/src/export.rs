use crate::{optical_center, Scene};
use cv_core::nalgebra::{Point3, Vector3};
use cv_core::Pose;
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use std::io::{self, Write};
use std::path::PathBuf;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];

/// Size of the camera pyramids drawn in snapshots, in world units.
const CAMERA_SIZE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum SnapshotFormat {
    PlyAscii,
    PlyBinary,
}

/// Which parts of the scene go into a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SnapshotContents {
    pub cameras: bool,
    /// Draw cameras as closed pyramids instead of loose vertices.
    pub camera_faces: bool,
    pub structure: bool,
}

impl Default for SnapshotContents {
    fn default() -> Self {
        Self {
            cameras: true,
            camera_faces: false,
            structure: true,
        }
    }
}

/// Intermediate scene files written while reconstructing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SnapshotSettings {
    pub directory: PathBuf,
    pub format: SnapshotFormat,
    pub contents: SnapshotContents,
}

impl SnapshotSettings {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            format: SnapshotFormat::PlyAscii,
            contents: SnapshotContents::default(),
        }
    }

    /// The file a snapshot with the given label is written to.
    pub fn path(&self, label: &str) -> PathBuf {
        self.directory.join(format!("sfm_{}.ply", label))
    }
}

pub struct ExportCamera {
    pub optical_center: Point3<f64>,
    pub up_direction: Vector3<f64>,
    pub forward_direction: Vector3<f64>,
    pub focal_length: f64,
}

/// The posed views of the scene as camera pyramids.
pub fn scene_cameras(scene: &Scene) -> Vec<ExportCamera> {
    scene
        .posed_views()
        .filter_map(|view| scene.pose(view))
        .map(|pose| {
            let rotation = pose.isometry().rotation.inverse();
            ExportCamera {
                optical_center: optical_center(pose),
                // Image y points down.
                up_direction: rotation * -Vector3::y(),
                forward_direction: rotation * Vector3::z(),
                focal_length: CAMERA_SIZE,
            }
        })
        .collect()
}

/// Writes the selected contents of the scene as a PLY file.
pub fn export_scene(
    writer: impl Write,
    scene: &Scene,
    format: SnapshotFormat,
    contents: SnapshotContents,
) -> io::Result<usize> {
    let points_and_colors = if contents.structure {
        scene
            .landmarks
            .values()
            .map(|landmark| (landmark.point, landmark.color))
            .collect()
    } else {
        vec![]
    };
    let cameras = if contents.cameras {
        scene_cameras(scene)
    } else {
        vec![]
    };
    let encoding = match format {
        SnapshotFormat::PlyAscii => Encoding::Ascii,
        SnapshotFormat::PlyBinary => Encoding::BinaryLittleEndian,
    };
    export(
        writer,
        encoding,
        points_and_colors,
        cameras,
        contents.cameras && contents.camera_faces,
    )
}

pub fn export(
    mut writer: impl Write,
    encoding: Encoding,
    points_and_colors: Vec<(Point3<f64>, [u8; 3])>,
    cameras: Vec<ExportCamera>,
    camera_faces: bool,
) -> io::Result<usize> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = encoding;
    ply.header
        .comments
        .push("Exported from rust-cv/cv-sequential-sfm".to_string());

    // Vertices hold both camera corners and structure points.
    let mut point_element = ElementDef::new("vertex".to_string());
    for axis in ["x", "y", "z"] {
        point_element.properties.add(PropertyDef::new(
            axis.to_string(),
            PropertyType::Scalar(ScalarType::Double),
        ));
    }
    for channel in ["red", "green", "blue"] {
        point_element.properties.add(PropertyDef::new(
            channel.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(point_element);

    if camera_faces {
        let mut face_element = ElementDef::new("face".to_string());
        face_element.properties.add(PropertyDef::new(
            "vertex_index".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        ));
        ply.header.elements.add(face_element);
    }

    let mut faces: Vec<DefaultElement> = vec![];
    let mut vertices: Vec<DefaultElement> = vec![];

    let mut add_vertex = |p: Point3<f64>, [r, g, b]: [u8; 3]| -> usize {
        let pos = vertices.len();
        let mut point = DefaultElement::new();
        point.insert("x".to_string(), Property::Double(p.x));
        point.insert("y".to_string(), Property::Double(p.y));
        point.insert("z".to_string(), Property::Double(p.z));
        point.insert("red".to_string(), Property::UChar(r));
        point.insert("green".to_string(), Property::UChar(g));
        point.insert("blue".to_string(), Property::UChar(b));
        vertices.push(point);
        pos
    };

    let mut add_triangle = |a: usize, b: usize, c: usize| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(vec![a as i32, b as i32, c as i32]),
        );
        faces.push(face);
    };

    for ExportCamera {
        optical_center,
        up_direction,
        forward_direction,
        focal_length,
    } in cameras
    {
        let right_direction = forward_direction.cross(&up_direction);
        let center_point = add_vertex(optical_center, CAMERA_COLOR);
        let [up_right, up_left, down_left, down_right] =
            [(1, 1), (1, -1), (-1, -1), (-1, 1)].map(|(up, right)| {
                add_vertex(
                    optical_center
                        + forward_direction * focal_length
                        + up as f64 * up_direction * focal_length
                        + right as f64 * right_direction * focal_length,
                    CAMERA_COLOR,
                )
            });

        if camera_faces {
            add_triangle(center_point, down_right, up_right);
            add_triangle(center_point, up_right, up_left);
            add_triangle(center_point, up_left, down_left);
            add_triangle(center_point, down_left, down_right);
        }
    }

    for (p, c) in points_and_colors {
        add_vertex(p, c);
    }

    ply.payload.insert("vertex".to_string(), vertices);
    if camera_faces {
        ply.payload.insert("face".to_string(), faces);
    }

    Writer::new().write_ply(&mut writer, &mut ply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CameraModelKind, Intrinsics, Landmark, View};
    use cv_core::nalgebra::Point2;
    use cv_core::WorldToCamera;
    use std::collections::BTreeMap;

    fn scene() -> Scene {
        let mut scene = Scene::new();
        scene.add_intrinsics(
            0,
            Intrinsics::new(CameraModelKind::Pinhole, 100.0, Point2::new(50.0, 50.0)),
        );
        let mut view = View::new(0, 100, 100);
        view.pose = Some(WorldToCamera::identity());
        scene.add_view(0, view);
        scene.add_view(1, View::new(0, 100, 100));
        for track in 0..3 {
            scene.landmarks.insert(
                track,
                Landmark {
                    point: Point3::new(track as f64, 0.0, 5.0),
                    color: [10, 20, 30],
                    observations: BTreeMap::new(),
                },
            );
        }
        scene
    }

    #[test]
    fn ascii_snapshot_contains_cameras_and_structure() {
        let mut buffer = vec![];
        let contents = SnapshotContents {
            camera_faces: true,
            ..SnapshotContents::default()
        };
        export_scene(&mut buffer, &scene(), SnapshotFormat::PlyAscii, contents).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        // One posed camera contributes five vertices and four faces.
        assert!(text.contains("element vertex 8"), "{}", text);
        assert!(text.contains("element face 4"), "{}", text);
        assert!(text.contains("10 20 30"));
    }

    #[test]
    fn structure_only_snapshot() {
        let mut buffer = vec![];
        let contents = SnapshotContents {
            cameras: false,
            camera_faces: true,
            structure: true,
        };
        export_scene(&mut buffer, &scene(), SnapshotFormat::PlyAscii, contents).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("element vertex 3"));
        assert!(!text.contains("element face"));
        assert_eq!(
            SnapshotSettings::new("/tmp/out").path("0003_grow"),
            PathBuf::from("/tmp/out/sfm_0003_grow.ply")
        );
    }
}
