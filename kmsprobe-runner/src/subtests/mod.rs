use crate::harness::Subtest;

mod commit;
mod crc;
mod cursor;

/// Every subtest, in execution order
pub static SUBTESTS: &[Subtest] = &[
    Subtest {
        name: "basic-legacy-commit",
        description: "Modeset and disable a pipe with legacy ioctls",
        run: commit::basic_legacy_commit,
    },
    Subtest {
        name: "atomic-test-only",
        description: "TEST_ONLY commits validate without touching the hardware",
        run: commit::atomic_test_only,
    },
    Subtest {
        name: "flip-event-nonblocking",
        description: "A nonblocking atomic flip delivers exactly one completion event",
        run: commit::flip_event_nonblocking,
    },
    Subtest {
        name: "plane-all-transition",
        description: "Enable and disable every plane of a pipe at once",
        run: commit::plane_all_transition,
    },
    Subtest {
        name: "cursor-vs-flip-same-frame",
        description: "Cursor moves land in the same frame as a pending flip",
        run: cursor::cursor_vs_flip_same_frame,
    },
    Subtest {
        name: "cursor-stress-threads",
        description: "Hammer the cursor from helper threads while waiting for vblanks",
        run: cursor::cursor_stress_threads,
    },
    Subtest {
        name: "crc-stable",
        description: "An unchanged scene yields identical CRCs",
        run: crc::crc_stable,
    },
];

#[cfg(test)]
mod tests {
    use super::SUBTESTS;
    use crate::harness::{Fixture, Outcome, SubtestError, Target};

    fn run(name: &str) -> Result<(), SubtestError> {
        let subtest = SUBTESTS.iter().find(|subtest| subtest.name == name).unwrap();
        let mut fixture = Fixture::open(&Target::Mock).unwrap();
        let result = (subtest.run)(&mut fixture);
        fixture.reset();
        result
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = SUBTESTS.iter().map(|subtest| subtest.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SUBTESTS.len());
    }

    #[test]
    fn commit_subtests_pass_on_the_mock() {
        for name in [
            "basic-legacy-commit",
            "atomic-test-only",
            "flip-event-nonblocking",
            "plane-all-transition",
        ] {
            if let Err(err) = run(name) {
                panic!("{} failed: {}", name, err);
            }
        }
    }

    #[test]
    fn cursor_subtests_pass_on_the_mock() {
        run("cursor-vs-flip-same-frame").unwrap();
        run("cursor-stress-threads").unwrap();
    }

    #[test]
    fn crc_skips_without_debugfs() {
        let err = run("crc-stable").unwrap_err();
        assert_eq!(err.outcome(), Outcome::Skip);
    }
}
