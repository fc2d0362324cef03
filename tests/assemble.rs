use approx::assert_abs_diff_eq;
use gesture_forge::{
    dataset::{AssembleOptions, assemble, discover_artifacts},
    normalize::normalize,
    store::SampleStore,
    types::{FEATURE_LEN, MIDDLE_MCP},
};
use ndarray::Array2;

fn hand_rows(rows: usize, offset: f32) -> Array2<f32> {
    Array2::from_shape_fn((rows, FEATURE_LEN), |(r, c)| {
        offset + (c / 3) as f32 * 0.03 + (c % 3) as f32 * 0.01 + r as f32 * 0.001
    })
}

#[test]
fn two_labels_assemble_in_lexicographic_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SampleStore::new(dir.path());
    store.append("volume_up", &hand_rows(10, 0.2)).expect("volume_up");
    store.append("mute", &hand_rows(5, 0.6)).expect("mute");

    let artifacts = discover_artifacts(dir.path()).expect("discover");
    let matrix = assemble(&artifacts, &AssembleOptions::default()).expect("assemble");

    assert_eq!(matrix.x.dim(), (15, FEATURE_LEN));
    assert_eq!(matrix.labels, vec!["mute", "volume_up"]);
    let mut expected = vec![0; 5];
    expected.extend(vec![1; 10]);
    assert_eq!(matrix.y, expected);

    for row in matrix.x.rows() {
        assert_eq!(&row.as_slice().expect("contiguous")[..3], &[0.0, 0.0, 0.0]);
        let p9 = &row.as_slice().expect("contiguous")[MIDDLE_MCP * 3..MIDDLE_MCP * 3 + 3];
        let norm = p9.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-5);
    }
}

#[test]
fn mapping_is_stable_across_runs_and_appends() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SampleStore::new(dir.path());
    for label in ["grab", "cursor", "draw_mode"] {
        store.append(label, &hand_rows(4, 0.1)).expect("append");
    }
    std::fs::write(dir.path().join("README.txt"), "not an artifact").expect("write");

    let first = assemble(
        &discover_artifacts(dir.path()).expect("discover"),
        &AssembleOptions::default(),
    )
    .expect("assemble");

    store.append("cursor", &hand_rows(3, 0.4)).expect("append");
    let second = assemble(
        &discover_artifacts(dir.path()).expect("discover"),
        &AssembleOptions::default(),
    )
    .expect("assemble");

    assert_eq!(first.labels, vec!["cursor", "draw_mode", "grab"]);
    assert_eq!(first.labels, second.labels);
    assert_eq!(second.class_counts(), vec![7, 4, 4]);
    assert!(second.y.iter().all(|&l| l < second.labels.len()));
}

#[test]
fn store_round_trip_matches_direct_normalization() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SampleStore::new(dir.path());
    let raw = hand_rows(6, 0.35);
    store.append("mute", &raw).expect("append");

    let matrix = assemble(&store.artifacts().expect("artifacts"), &AssembleOptions::default())
        .expect("assemble");
    let direct = normalize(&raw).expect("normalize");
    for (a, b) in matrix.x.iter().zip(direct.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
}
