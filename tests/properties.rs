//! Property-based tests for the state line, profile candidates and
//! domain-reference rewriting.

use proptest::prelude::*;
use std::path::PathBuf;

use realmshift::profiles::Candidate;
use realmshift::state::{MigrationState, Mode, Phase};
use realmshift::steps::{CATALOGUE, StepId, replace_domain};

fn domain_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,10}(\\.[a-z][a-z0-9]{0,10}){1,3}"
}

fn hostname_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,14}"
}

fn mode_strategy() -> impl Strategy<Value = Mode> {
    prop_oneof![
        Just(Mode::Technician),
        Just(Mode::Live),
        Just(Mode::DryRun),
        Just(Mode::Test),
    ]
}

fn phase_strategy() -> impl Strategy<Value = Phase> {
    prop_oneof![
        Just(Phase::InProgress),
        Just(Phase::PostReboot),
        Just(Phase::Resumed),
        Just(Phase::Complete),
    ]
}

proptest! {
    // ========================================================================
    // State line
    // ========================================================================

    #[test]
    fn state_line_survives_a_restart(
        step in 0u32..=23,
        mode in mode_strategy(),
        phase in phase_strategy(),
        domain in domain_strategy(),
        hostname in hostname_strategy(),
        old in proptest::option::of(domain_strategy()),
    ) {
        let mut state = MigrationState::new(mode, &domain, &hostname, old.as_deref());
        state.step = step;
        state.phase = phase;

        let parsed = MigrationState::parse(&state.to_line());
        prop_assert_eq!(parsed, Some(state));
    }

    #[test]
    fn state_line_without_separators_is_rejected(line in "[^|]{0,64}") {
        prop_assert!(MigrationState::parse(&line).is_none());
    }

    #[test]
    fn step_ordinals_resolve_back(ordinal in 1u32..=23) {
        let step = StepId::from_ordinal(ordinal).unwrap();
        prop_assert_eq!(step.ordinal(), ordinal);
        prop_assert_eq!(CATALOGUE[ordinal as usize - 1], step);
    }

    // ========================================================================
    // Profile candidates
    // ========================================================================

    #[test]
    fn names_without_separator_are_never_candidates(name in "[a-z][a-z0-9._-]{0,20}") {
        prop_assert!(Candidate::from_dir(PathBuf::from("/home").join(&name)).is_none());
    }

    #[test]
    fn separated_names_split_at_the_first_separator(
        user in "[a-z][a-z0-9._-]{0,12}",
        domain in domain_strategy(),
    ) {
        let name = format!("{user}@{domain}");
        let candidate = Candidate::from_dir(PathBuf::from("/home").join(&name)).unwrap();
        prop_assert_eq!(candidate.user, user);
        prop_assert_eq!(candidate.domain, domain);
        prop_assert_eq!(candidate.dir_name, name);
    }

    // ========================================================================
    // Domain references
    // ========================================================================

    #[test]
    fn text_without_the_old_domain_is_unchanged(text in "[a-np-zA-NP-Z0-9 .,=/\\n]{0,120}") {
        prop_assert_eq!(replace_domain(&text, "oldco.local", "newco.local"), text);
    }

    #[test]
    fn every_standalone_old_domain_is_rewritten(
        words in proptest::collection::vec(
            prop_oneof![Just("oldco.local".to_string()), "[a-z]{1,8}"],
            0..20,
        ),
    ) {
        let text = words.join(" ");
        let before = words.iter().filter(|w| *w == "oldco.local").count();

        let rewritten = replace_domain(&text, "oldco.local", "newco.local");
        let tokens: Vec<&str> = rewritten.split(' ').filter(|t| !t.is_empty()).collect();
        prop_assert!(tokens.iter().all(|t| !t.eq_ignore_ascii_case("oldco.local")));
        prop_assert!(tokens.iter().filter(|t| **t == "newco.local").count() >= before);
    }
}
