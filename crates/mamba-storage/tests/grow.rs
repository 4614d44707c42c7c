//! Datasets growing past their preallocated rows.

use mamba_storage::{DType, DataFile, NativeFile};
use mamba_core::Value;

#[test]
fn five_rows_into_a_one_row_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.json");
    let mut file = NativeFile::create(&path).unwrap();
    file.add_section("scan").unwrap();
    file.add_section("scan/data").unwrap();
    file.add_dataset("scan/data", "spectrum", DType::F64, &[1, 3], &[None, Some(3)])
        .unwrap();

    let mut shapes = Vec::new();
    for i in 0..5 {
        let row = Value::Array(vec![i as f64, i as f64 + 0.5, i as f64 + 1.0]);
        file.append_data("scan/data", "spectrum", &row).unwrap();
        shapes.push(file.shape("scan/data", "spectrum").unwrap());
    }
    assert_eq!(
        shapes,
        vec![vec![1, 3], vec![2, 3], vec![3, 3], vec![4, 3], vec![5, 3]]
    );
    file.close_file().unwrap();

    let tree = NativeFile::load(&path).unwrap();
    let ds = tree.dataset("scan/data", "spectrum").unwrap();
    assert_eq!(ds.shape, vec![5, 3]);
    let firsts: Vec<f64> = ds
        .values()
        .iter()
        .map(|v| match v {
            Value::Array(a) => a[0],
            other => panic!("unexpected row {:?}", other),
        })
        .collect();
    assert_eq!(firsts, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn preallocated_rows_are_filled_before_growing() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = NativeFile::create(dir.path().join("pre.json")).unwrap();
    file.add_section("scan").unwrap();
    file.add_dataset("scan", "n", DType::I32, &[3], &[None]).unwrap();
    for i in 0..3 {
        file.append_data("scan", "n", &Value::Int(i)).unwrap();
        assert_eq!(file.shape("scan", "n"), Some(vec![3]));
    }
    file.append_data("scan", "n", &Value::Int(3)).unwrap();
    assert_eq!(file.shape("scan", "n"), Some(vec![4]));
}

#[test]
fn second_writer_on_the_same_path_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.json");
    let mut first = NativeFile::create(&path).unwrap();
    let err = NativeFile::create(&path).err().unwrap();
    assert_eq!(err.kind(), mamba_core::ErrorKind::Dup);
    first.close_file().unwrap();
    assert!(NativeFile::create(&path).is_ok());
}
