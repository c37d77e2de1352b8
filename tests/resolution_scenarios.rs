//! End-to-end scenarios for the turn resolution pipeline.
//!
//! All scenarios run against deterministic doubles: a scripted (or
//! prompt-keyed) oracle and fixed dice sequences. No network, and no RNG
//! unless the scenario wants one.

use encounter_core::dispatcher::ReactionDispatcher;
use encounter_core::rules::TurnRolls;
use encounter_core::testing::{
    failing_oracle, EventLog, NotationRoller, ScriptedOracle, SequenceRoller,
};
use encounter_core::{
    replay, AbilityKind, ActiveCondition, CancelToken, Combatant, CombatantId, ConcentrationLink,
    Condition, DamageType, Decision, EncounterState, EngineEvent, Environment, Intent, LogEntry,
    Mode, OracleError, ResolutionConfig, Resolver, RulesEngine, Side, SourceTier, Status, Winner,
};
use std::time::{Duration, Instant};

fn setup() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn melee(bonus: i32, damage: &str) -> AbilityKind {
    AbilityKind::Attack {
        bonus,
        damage: damage.into(),
        damage_type: DamageType::Piercing,
        ranged: false,
        reach_ft: 5,
    }
}

fn ranged(bonus: i32, damage: &str, damage_type: DamageType) -> AbilityKind {
    AbilityKind::Attack {
        bonus,
        damage: damage.into(),
        damage_type,
        ranged: true,
        reach_ft: 60,
    }
}

fn place_all(state: &mut EncounterState, feet: i32) {
    let ids: Vec<CombatantId> = state.combatants.iter().map(|c| c.id.clone()).collect();
    for a in &ids {
        for b in &ids {
            if a != b {
                state
                    .combatant_mut(a)
                    .unwrap()
                    .position
                    .distance_to
                    .insert(b.clone(), feet);
            }
        }
    }
}

/// I9: every turn_start opens a turn; intents open segments; dice only
/// inside segments; result/rollback closes them. Legendary segments may
/// appear between turns without a turn_start.
fn assert_event_ordering(events: &[EngineEvent]) {
    let mut open_segment = false;
    let mut pending_turn = false;
    for event in events {
        match event {
            EngineEvent::TurnStart { .. } => {
                assert!(!open_segment, "turn_start inside an open segment");
                assert!(!pending_turn, "turn_start before the previous turn produced an intent");
                pending_turn = true;
            }
            EngineEvent::Intent { .. } => {
                assert!(!open_segment, "intent inside an open segment");
                open_segment = true;
                pending_turn = false;
            }
            EngineEvent::Dice { .. } => {
                assert!(open_segment, "dice event outside an intent segment");
            }
            EngineEvent::Result { .. } | EngineEvent::Rollback { .. } => {
                assert!(open_segment, "terminal segment event without an intent");
                open_segment = false;
            }
            _ => {}
        }
    }
    assert!(!open_segment, "stream ended with an unclosed segment");
}

// =============================================================================
// Scenario 1: Kobold vs. Commoner, deterministic rolls
// =============================================================================

#[test]
fn scenario_kobold_crits_commoner_dead_round_one() {
    setup();
    let kobold = Combatant::new("kobold", "Kobold", Side::Monster)
        .with_hp(5)
        .with_ac(12)
        .with_initiative(15)
        .add_ability("Dagger", melee(4, "1d4+2"));
    let commoner = Combatant::new("commoner", "Commoner", Side::Player)
        .with_hp(4)
        .with_ac(10)
        .with_initiative(10)
        .add_ability("Club", melee(2, "1d4"));
    let mut state = EncounterState::new(vec![kobold, commoner], Environment::default());
    place_all(&mut state, 5);

    let oracle = ScriptedOracle::always(
        r#"{"action_type": "attack", "ability_name": "Dagger", "targets": ["commoner"], "narrative": "The kobold lunges."}"#,
    );
    let log = EventLog::new();
    let resolver = Resolver::default();
    let mut handle = resolver
        .start(
            state,
            SequenceRoller::new(vec![20, 10]).into_fn(),
            oracle.into_fn(),
            log.observer(),
            Mode::Continuous,
        )
        .unwrap();
    assert!(handle.wait(Duration::from_secs(10)), "resolution should finish");

    // Natural 20 doubles the dice: the roller sees 2d4+2, worth 10, which
    // overkills a 4 HP commoner outright.
    let events = log.events();
    let dice: Vec<(String, i32)> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Dice {
                expression, result, ..
            } => Some((expression.clone(), *result)),
            _ => None,
        })
        .collect();
    assert_eq!(dice, vec![("1d20".to_string(), 20), ("2d4+2".to_string(), 10)]);

    assert!(log.count_of("turn_start") <= 2);
    assert_eq!(
        log.last(),
        Some(EngineEvent::EncounterEnd {
            winner: Winner::Monsters
        })
    );
    assert_event_ordering(&events);
}

// =============================================================================
// Scenario 2: Legendary dragon vs. party of one
// =============================================================================

#[test]
fn scenario_legendary_actions_between_turns_and_round_reset() {
    setup();
    let dragon = Combatant::new("dragon", "Dragon", Side::Monster)
        .with_hp(120)
        .with_ac(18)
        .with_initiative(10)
        .with_legendary(1)
        .add_ability("Bite", melee(10, "2d10+6"))
        .add_ability(
            "Tail Attack",
            AbilityKind::Legendary {
                cost: 1,
                attack: Box::new(melee(10, "2d8+6")),
            },
        );
    let hero = Combatant::new("hero", "Hero", Side::Player)
        .with_hp(40)
        .with_ac(17)
        .with_initiative(20)
        .add_ability("Sword", melee(6, "1d8+3"));
    let mut state = EncounterState::new(vec![dragon, hero], Environment::default());
    place_all(&mut state, 5);

    // Key responses off the prompt so script order cannot drift.
    let oracle = |prompt: &str, _token: &CancelToken| -> Result<String, OracleError> {
        if prompt.contains("# LEGENDARY ACTION") {
            Ok(r#"{"action_type": "legendary", "ability_name": "Tail Attack", "targets": ["hero"]}"#.to_string())
        } else if prompt.contains("ACTIVE COMBATANT: Dragon") {
            Ok(r#"{"action_type": "attack", "ability_name": "Bite", "targets": ["hero"]}"#.to_string())
        } else {
            Ok(r#"{"action_type": "attack", "ability_name": "Sword", "targets": ["dragon"]}"#.to_string())
        }
    };

    let log = EventLog::new();
    let resolver = Resolver::new(ResolutionConfig::default().with_max_rounds(2));
    let mut handle = resolver
        .start(
            state,
            |_expr: &str| 2, // everything misses; the encounter runs its rounds out
            oracle,
            log.observer(),
            Mode::Continuous,
        )
        .unwrap();
    assert!(handle.wait(Duration::from_secs(10)));

    let events = log.events();
    let legendary_intents: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            matches!(
                e,
                EngineEvent::Intent {
                    intent: Intent::Legendary { .. },
                    ..
                }
            )
        })
        .map(|(i, _)| i)
        .collect();

    // A pool of one refills at round start: one legendary action per
    // round, two rounds, two legendary intents.
    assert_eq!(legendary_intents.len(), 2);

    // The first legendary intent is dispatcher-originated: it follows the
    // hero's result and precedes the dragon's own turn_start.
    let hero_result = events
        .iter()
        .position(|e| matches!(e, EngineEvent::Result { turn_record } if turn_record.combatant_id == CombatantId::from("hero")))
        .expect("hero turn result");
    let dragon_turn = events
        .iter()
        .position(|e| matches!(e, EngineEvent::TurnStart { combatant_id, .. } if combatant_id == &CombatantId::from("dragon")))
        .expect("dragon turn start");
    assert!(hero_result < legendary_intents[0]);
    assert!(legendary_intents[0] < dragon_turn);

    assert_eq!(log.last(), Some(EngineEvent::EncounterEnd { winner: Winner::Draw }));
    assert_event_ordering(&events);
}

// =============================================================================
// Scenario 3: Ability bleed suppressed
// =============================================================================

#[test]
fn scenario_foreign_ability_rejected_and_replaced() {
    setup();
    let drake = Combatant::new("drake", "Drake", Side::Monster)
        .with_hp(20)
        .with_ac(13)
        .with_initiative(18)
        .add_ability("Fire Breath", ranged(5, "2d6", DamageType::Fire));
    let skeleton = Combatant::new("skeleton", "Skeleton", Side::Monster)
        .with_hp(13)
        .with_ac(12)
        .with_initiative(12)
        .add_ability("Bone Shards", ranged(4, "1d6", DamageType::Piercing));
    let hero = Combatant::new("hero", "Hero", Side::Player)
        .with_hp(25)
        .with_ac(16)
        .with_initiative(15)
        .add_ability("Bow", ranged(5, "1d8+2", DamageType::Piercing));
    let mut state = EncounterState::new(vec![drake, skeleton, hero], Environment::default());
    place_all(&mut state, 30);

    // The oracle leaks the skeleton's ability into the drake's turn,
    // every time it is asked.
    let oracle = |prompt: &str, _token: &CancelToken| -> Result<String, OracleError> {
        if prompt.contains("ACTIVE COMBATANT: Drake") {
            Ok(r#"{"action_type": "attack", "ability_name": "Bone Shards", "targets": ["hero"]}"#.to_string())
        } else {
            Ok(r#"{"action_type": "dodge", "targets": []}"#.to_string())
        }
    };

    let log = EventLog::new();
    let resolver = Resolver::new(ResolutionConfig::default().with_max_rounds(1));
    let mut handle = resolver
        .start(state, |_expr: &str| 2, oracle, log.observer(), Mode::Continuous)
        .unwrap();
    assert!(handle.wait(Duration::from_secs(10)));

    let events = log.events();
    let drake_intents: Vec<(&Intent, SourceTier)> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Intent {
                combatant_id,
                intent,
                source_tier,
            } if combatant_id == &CombatantId::from("drake") => Some((intent, *source_tier)),
            _ => None,
        })
        .collect();

    assert_eq!(drake_intents.len(), 1);
    let (intent, tier) = drake_intents[0];
    assert!(matches!(tier, SourceTier::OracleRetry | SourceTier::Heuristic));
    // Whatever the drake ended up doing, it used its own ability.
    if let Some(name) = intent.ability_name() {
        assert_eq!(name, "Fire Breath");
    }
    assert!(!events.iter().any(|e| matches!(
        e,
        EngineEvent::Intent { combatant_id, intent, .. }
            if combatant_id == &CombatantId::from("drake")
                && intent.ability_name() == Some("Bone Shards")
    )));
    assert_event_ordering(&events);
}

// =============================================================================
// Scenario 4: Oracle timeout falls back to the heuristic
// =============================================================================

#[test]
fn scenario_oracle_timeout_falls_back_to_heuristic() {
    setup();
    let kobold = Combatant::new("kobold", "Kobold", Side::Monster)
        .with_hp(5)
        .with_ac(12)
        .with_initiative(15)
        .add_ability("Dagger", melee(4, "1d4+2"));
    let hero = Combatant::new("hero", "Hero", Side::Player)
        .with_hp(20)
        .with_ac(16)
        .with_initiative(10)
        .add_ability("Sword", melee(5, "1d8+3"));
    let mut state = EncounterState::new(vec![kobold, hero], Environment::default());
    place_all(&mut state, 5);

    let oracle = ScriptedOracle::always("{\"action_type\": \"dodge\"}")
        .with_delay(Duration::from_millis(500));
    let log = EventLog::new();
    let resolver = Resolver::new(
        ResolutionConfig::default()
            .with_oracle_deadline_ms(40)
            .with_max_rounds(1),
    );
    let mut handle = resolver
        .start(
            state,
            |_expr: &str| 2,
            oracle.into_fn(),
            log.observer(),
            Mode::Continuous,
        )
        .unwrap();
    assert!(handle.wait(Duration::from_secs(20)));

    let events = log.events();
    let results: Vec<SourceTier> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Result { turn_record } => Some(turn_record.source_tier),
            _ => None,
        })
        .collect();

    // One result per turn, every one of them from the heuristic tier.
    assert_eq!(results.len(), log.count_of("turn_start"));
    assert!(results.iter().all(|tier| *tier == SourceTier::Heuristic));
    assert_event_ordering(&events);
}

// =============================================================================
// Scenario 5: Cancellation mid-oracle
// =============================================================================

#[test]
fn scenario_stop_mid_oracle_exits_cleanly() {
    setup();
    let kobold = Combatant::new("kobold", "Kobold", Side::Monster)
        .with_hp(5)
        .with_ac(12)
        .with_initiative(15)
        .add_ability("Dagger", melee(4, "1d4+2"));
    let hero = Combatant::new("hero", "Hero", Side::Player)
        .with_hp(20)
        .with_ac(16)
        .with_initiative(10)
        .add_ability("Sword", melee(5, "1d8+3"));
    let mut state = EncounterState::new(vec![kobold, hero], Environment::default());
    place_all(&mut state, 5);

    let oracle = ScriptedOracle::always("{\"action_type\": \"dodge\"}")
        .with_delay(Duration::from_secs(30));
    let log = EventLog::new();
    let resolver = Resolver::new(ResolutionConfig::default().with_stop_grace_ms(5_000));
    let mut handle = resolver
        .start(
            state,
            |_expr: &str| 2,
            oracle.into_fn(),
            log.observer(),
            Mode::Continuous,
        )
        .unwrap();

    // Let the worker get into the oracle call, then stop.
    std::thread::sleep(Duration::from_millis(100));
    let begun = Instant::now();
    handle.stop();
    assert!(begun.elapsed() < Duration::from_secs(5), "stop must not hang");
    assert!(!handle.status().running);

    handle.pump_events();
    let events = log.events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Result { .. }))
            .count(),
        0,
        "the in-flight turn must not commit"
    );
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Fatal { .. })));
}

// =============================================================================
// Scenario 6: Concentration drop clears linked effects
// =============================================================================

#[test]
fn scenario_concentration_drop_clears_bless() {
    setup();
    let wizard_id = CombatantId::from("wizard");
    let mut wizard = Combatant::new("wizard", "Wizard", Side::Player)
        .with_hp(20)
        .with_ac(10);
    wizard.concentration = Some(ConcentrationLink {
        spell: "bless".into(),
        targets: vec![CombatantId::from("ally-1"), CombatantId::from("ally-2")],
    });

    let mut ally = |id: &str| {
        let mut c = Combatant::new(id, id, Side::Player).with_hp(15);
        c.conditions.push(ActiveCondition::new(
            Condition::Linked("bless".into()),
            wizard_id.clone(),
        ));
        c
    };
    let ogre = Combatant::new("ogre", "Ogre", Side::Monster)
        .with_hp(40)
        .with_ac(11)
        .add_ability("Greatclub", melee(6, "2d8+4"));

    let mut state = EncounterState::new(
        vec![wizard, ally("ally-1"), ally("ally-2"), ogre],
        Environment::default(),
    );
    place_all(&mut state, 5);

    let engine = RulesEngine::new(ResolutionConfig::default());
    // Attack roll 15 hits AC 10; 12 damage; Con save DC max(10, 6) = 10,
    // rolled 3: concentration breaks.
    let mut roller = SequenceRoller::new(vec![15, 12, 3]);
    let mut roll_fn = roller.as_fn();
    let mut emit = |_event: EngineEvent| {};
    let mut rolls = TurnRolls::new(&mut roll_fn, &mut emit, CombatantId::from("ogre"));
    let decision = Decision::from_intent(Intent::Attack {
        ability_name: "Greatclub".into(),
        targets: vec![wizard_id.clone()],
        movement_cost: None,
    });
    let results = engine
        .execute(
            &mut state,
            &CombatantId::from("ogre"),
            &decision,
            &mut rolls,
            &ReactionDispatcher::new(),
        )
        .unwrap();

    assert_eq!(results.concentration_drops, vec![(wizard_id.clone(), "bless".to_string())]);
    assert_eq!(
        results
            .conditions_removed
            .iter()
            .filter(|(_, c)| *c == Condition::Linked("bless".into()))
            .count(),
        2
    );
    for id in ["ally-1", "ally-2"] {
        assert!(!state
            .combatant(&CombatantId::from(id))
            .unwrap()
            .has_condition(&Condition::Linked("bless".into())));
    }
    assert!(state.combatant(&wizard_id).unwrap().concentration.is_none());
}

// =============================================================================
// Invariants over a full random skirmish
// =============================================================================

#[test]
fn invariants_hold_over_a_heuristic_skirmish() {
    setup();
    let orc = Combatant::new("orc", "Orc", Side::Monster)
        .with_hp(15)
        .with_ac(13)
        .with_initiative(12)
        .add_ability("Greataxe", melee(5, "1d12+3"));
    let goblin = Combatant::new("goblin", "Goblin", Side::Monster)
        .with_hp(7)
        .with_ac(15)
        .with_initiative(14)
        .add_ability("Scimitar", melee(4, "1d6+2"));
    let fighter = Combatant::new("fighter", "Fighter", Side::Player)
        .with_hp(24)
        .with_ac(16)
        .with_initiative(16)
        .add_ability("Longsword", melee(5, "1d8+3"));
    let cleric = Combatant::new("cleric", "Cleric", Side::Player)
        .with_hp(18)
        .with_ac(15)
        .with_initiative(8)
        .add_ability("Mace", melee(4, "1d6+2"));
    let mut state = EncounterState::new(vec![orc, goblin, fighter, cleric], Environment::default());
    place_all(&mut state, 5);
    let initial = state.clone();

    // A dead oracle: every turn comes from the heuristic tier. Real dice
    // drive the outcome.
    let log = EventLog::new();
    let resolver = Resolver::default();
    let mut handle = resolver
        .start(
            state,
            NotationRoller::into_fn(),
            failing_oracle(),
            log.observer(),
            Mode::Continuous,
        )
        .unwrap();
    assert!(handle.wait(Duration::from_secs(30)), "skirmish must terminate");

    let events = log.events();
    assert_event_ordering(&events);

    // I8: terminal event closes the stream.
    let last = events.last().expect("events were emitted");
    assert!(last.is_terminal());

    // Round-trip law: replaying the committed records over the initial
    // roster reproduces a consistent final picture.
    let records: Vec<LogEntry> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Result { turn_record } => Some(LogEntry::Turn(turn_record.clone())),
            _ => None,
        })
        .collect();
    let roster = replay(&initial, &records);

    for combatant in &roster {
        // I1: HP bounds.
        assert!(combatant.hp >= 0 && combatant.hp <= combatant.max_hp);
        // I2: down statuses imply zero HP.
        if matches!(combatant.status, Status::Unconscious | Status::Dead) {
            assert_eq!(combatant.hp, 0, "{} is down with hp", combatant.id);
        }
    }

    // The declared winner matches the replayed roster.
    if let EngineEvent::EncounterEnd { winner } = last {
        let monsters_up = roster
            .iter()
            .any(|c| c.side == Side::Monster && !c.status.is_down());
        let players_up = roster
            .iter()
            .any(|c| c.side != Side::Monster && !c.status.is_down());
        match winner {
            Winner::Monsters => assert!(monsters_up && !players_up),
            Winner::Players => assert!(players_up && !monsters_up),
            Winner::Draw => {}
        }
    }
}

// =============================================================================
// Step mode
// =============================================================================

#[test]
fn step_mode_pauses_after_each_turn() {
    setup();
    let kobold = Combatant::new("kobold", "Kobold", Side::Monster)
        .with_hp(5)
        .with_ac(12)
        .with_initiative(15)
        .add_ability("Dagger", melee(4, "1d4+2"));
    let hero = Combatant::new("hero", "Hero", Side::Player)
        .with_hp(20)
        .with_ac(16)
        .with_initiative(10)
        .add_ability("Sword", melee(5, "1d8+3"));
    let mut state = EncounterState::new(vec![kobold, hero], Environment::default());
    place_all(&mut state, 5);

    let oracle = ScriptedOracle::always("{\"action_type\": \"dodge\"}");
    let log = EventLog::new();
    let resolver = Resolver::new(ResolutionConfig::default().with_max_rounds(3));
    let mut handle = resolver
        .start(
            state,
            |_expr: &str| 2,
            oracle.into_fn(),
            log.observer(),
            Mode::Step,
        )
        .unwrap();

    // The worker should pause after the first turn rather than run on.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        handle.pump_events();
        let status = handle.status();
        if status.paused {
            break;
        }
        assert!(status.running, "worker ended before pausing in step mode");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(handle.status().paused);
    assert_eq!(log.count_of("turn_start"), 1);

    handle.resume().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && log.count_of("turn_start") < 2 {
        handle.pump_events();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(log.count_of("turn_start") >= 2);

    handle.stop();
}
