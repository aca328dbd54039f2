//! NPV cube binary serialization round-trips.

use chrono::NaiveDate;
use ferroxva::cube::NpvCube;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// 10 trades x 5 dates x 100 samples x depth 2 with sentinel values in
/// every cell survives a save/load cycle exactly.
#[test]
fn cube_round_trip_is_exact() {
    let ids: Vec<String> = (0..10).map(|i| format!("TRD-{i:03}")).collect();
    let dates = vec![
        date(2026, 9, 1),
        date(2026, 10, 1),
        date(2026, 11, 1),
        date(2026, 12, 1),
        date(2027, 1, 1),
    ];
    let mut cube = NpvCube::new(date(2026, 8, 1), ids, dates, 100, 2);

    for id in 0..10 {
        for d in 0..5 {
            for s in 0..100 {
                for k in 0..2 {
                    let sentinel = (id + 1) as f64 * 1000.0
                        + (d + 1) as f64 * 100.0
                        + s as f64
                        + k as f64 * 0.5;
                    cube.set(sentinel, id, d, s, k).unwrap();
                }
            }
        }
        cube.set_t0(-(id as f64), id, 0).unwrap();
        cube.set_t0(id as f64 * 2.0, id, 1).unwrap();
    }

    let mut payload = Vec::new();
    cube.save(&mut payload).unwrap();
    let loaded = NpvCube::load(&mut payload.as_slice()).unwrap();

    assert_eq!(loaded.ids(), cube.ids());
    assert_eq!(loaded.dates(), cube.dates());
    assert_eq!(loaded.samples(), cube.samples());
    assert_eq!(loaded.depth(), cube.depth());
    assert_eq!(loaded.asof(), cube.asof());
    for id in 0..10 {
        for d in 0..5 {
            for s in 0..100 {
                for k in 0..2 {
                    assert_eq!(
                        loaded.get(id, d, s, k).unwrap(),
                        cube.get(id, d, s, k).unwrap(),
                        "cell ({id}, {d}, {s}, {k}) differs"
                    );
                }
            }
        }
        assert_eq!(loaded.get_t0(id, 0).unwrap(), cube.get_t0(id, 0).unwrap());
        assert_eq!(loaded.get_t0(id, 1).unwrap(), cube.get_t0(id, 1).unwrap());
    }
}

#[test]
fn dimensions_are_fixed_after_construction() {
    let cube = NpvCube::new(
        date(2026, 8, 1),
        vec!["A".into(), "B".into()],
        vec![date(2026, 9, 1)],
        4,
        1,
    );
    assert_eq!(cube.num_ids(), 2);
    assert_eq!(cube.num_dates(), 1);
    assert_eq!(cube.samples(), 4);
    assert!(cube.get(2, 0, 0, 0).is_err());
    assert!(cube.get(0, 1, 0, 0).is_err());
}
