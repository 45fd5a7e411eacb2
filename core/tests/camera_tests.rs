use gs_core::{fov_to_focal, scene_extent, Camera, CameraJson, Image};
use nalgebra::{Matrix3, Point3, Vector3};

fn target(width: u32, height: u32) -> Image {
    Image::filled(width, height, Vector3::new(0.2, 0.4, 0.6))
}

#[test]
fn test_world_to_view_and_center() {
    let center = Point3::new(1.0, 2.0, -3.0);
    let cam = Camera::from_center(
        7,
        "frame_007.png",
        center,
        Matrix3::identity(),
        0.9,
        0.7,
        target(64, 48),
        None,
        Vector3::zeros(),
    )
    .unwrap();

    assert!((cam.center() - center).norm() < 1e-6);
    let ahead = cam.world_to_view(&Vector3::new(1.0, 2.0, 2.0));
    assert!((ahead - Vector3::new(0.0, 0.0, 5.0)).norm() < 1e-6);
    assert!((cam.focal_x() - fov_to_focal(0.9, 64)).abs() < 1e-4);
}

#[test]
fn test_camera_json_roundtrip() {
    let c2w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let cam = Camera::from_center(
        3,
        "img_3",
        Point3::new(0.5, -1.0, 4.0),
        c2w,
        1.1,
        0.8,
        target(32, 24),
        None,
        Vector3::zeros(),
    )
    .unwrap();

    let json = cam.to_json(3);
    let text = serde_json::to_string(&json).unwrap();
    assert!(text.contains("\"FovX\""));
    assert!(text.contains("\"img_name\":\"img_3\""));

    let back: CameraJson = serde_json::from_str(&text).unwrap();
    assert_eq!(back, json);
    assert!((back.cam_to_world() - c2w).norm() < 1e-6);
    assert!((back.center() - cam.center()).norm() < 1e-5);
}

#[test]
fn test_mask_is_applied_to_target() {
    let mut mask = Image::new(4, 4, 1);
    mask.data[0] = 1.0;
    let cam = Camera::new(
        0,
        "masked",
        Matrix3::identity(),
        Vector3::zeros(),
        1.0,
        1.0,
        target(4, 4),
        Some(mask),
        Vector3::zeros(),
    )
    .unwrap();
    assert!((cam.image.pixel(0, 0).x - 0.2).abs() < 1e-6);
    assert_eq!(cam.image.pixel(1, 0), Vector3::zeros());
}

#[test]
fn test_invalid_camera_rejected() {
    let grey = Image::new(4, 4, 1);
    assert!(Camera::new(
        0,
        "grey",
        Matrix3::identity(),
        Vector3::zeros(),
        1.0,
        1.0,
        grey,
        None,
        Vector3::zeros(),
    )
    .is_err());

    assert!(Camera::new(
        0,
        "flat",
        Matrix3::identity(),
        Vector3::zeros(),
        0.0,
        1.0,
        target(4, 4),
        None,
        Vector3::zeros(),
    )
    .is_err());
}

#[test]
fn test_scene_extent_of_ring() {
    let cams: Vec<Camera> = (0..4)
        .map(|i| {
            let a = i as f32 * std::f32::consts::FRAC_PI_2;
            Camera::from_center(
                i,
                format!("ring_{i}"),
                Point3::new(2.0 * a.cos(), 2.0 * a.sin(), 0.0),
                Matrix3::identity(),
                1.0,
                1.0,
                target(4, 4),
                None,
                Vector3::zeros(),
            )
            .unwrap()
        })
        .collect();
    assert!((scene_extent(&cams) - 2.2).abs() < 1e-5);
}
