use anyhow::Result;
use ember_script::{ActorEvent, HudLayer, ScriptSession, SessionOptions, Verdict};
use mlua::Value;

fn new_session() -> Result<ScriptSession> {
    ScriptSession::new(SessionOptions::default())
}

#[test]
fn registration_order_is_dispatch_order() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            order = {}
            addHook("ThinkFrame", function() table.insert(order, "first") end)
            addHook("ThinkFrame", function() table.insert(order, "second") end)
            addHook("ThinkFrame", function() table.insert(order, "third") end)
        "#,
        "order.lua",
    )?;
    session.fire_think_frame();
    let order: String = session.eval("table.concat(order, ',')")?;
    assert_eq!(order, "first,second,third", "callbacks ran out of order");
    Ok(())
}

#[test]
fn registering_twice_means_two_calls() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            count = 0
            local bump = function() count = count + 1 end
            addHook("ThinkFrame", bump)
            addHook("ThinkFrame", bump)
        "#,
        "twice.lua",
    )?;
    session.fire_think_frame();
    let count: i64 = session.eval("count")?;
    assert_eq!(count, 2, "duplicate registration must not deduplicate");
    Ok(())
}

#[test]
fn generic_row_fires_before_kind_specific() -> Result<()> {
    let session = new_session()?;
    // The kind-specific hook registers first; the generic row must
    // still run ahead of it.
    session.load(
        r#"
            order = {}
            addHook("ActorThink", function(actor) table.insert(order, "typed") end, 7)
            addHook("ActorThink", function(actor) table.insert(order, "generic") end)
        "#,
        "rows.lua",
    )?;
    let subject = session.spawn_actor(7);
    session.fire_actor_hook(ActorEvent::Think, subject);
    let order: String = session.eval("table.concat(order, ',')")?;
    assert_eq!(order, "generic,typed");

    let other = session.spawn_actor(3);
    session.fire_actor_hook(ActorEvent::Think, other);
    let order: String = session.eval("table.concat(order, ',')")?;
    assert_eq!(
        order, "generic,typed,generic",
        "kind 3 must only reach the generic row"
    );
    Ok(())
}

#[test]
fn erroring_callback_is_contained() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            calls = {}
            addHook("PlayerMsg", function() table.insert(calls, "a") error("boom") end)
            addHook("PlayerMsg", function() table.insert(calls, "b") return true end)
        "#,
        "contained.lua",
    )?;
    let handled = session.fire_player_msg(0, 1, "hello");
    assert!(handled, "the surviving callback's verdict must count");
    let calls: String = session.eval("table.concat(calls, ',')")?;
    assert_eq!(calls, "a,b", "dispatch must not stop at the failing callback");
    Ok(())
}

#[test]
fn string_buckets_fire_unqualified_then_exact_key() -> Result<()> {
    let session = new_session()?;
    // "Fox" canonicalizes to "fox" at registration (lower-case event).
    session.load(
        r#"
            calls = {}
            addHook("BotThink", function() table.insert(calls, "U") end)
            addHook("BotThink", function() table.insert(calls, "Q") end, "Fox")
        "#,
        "buckets.lua",
    )?;
    session.fire_bot_think("fox", 0)?;
    let calls: String = session.eval("table.concat(calls, ',')")?;
    assert_eq!(calls, "U,Q");

    session.fire_bot_think("wolf", 0)?;
    let calls: String = session.eval("table.concat(calls, ',')")?;
    assert_eq!(calls, "U,Q,U", "the wolf firing must skip the fox bucket");
    Ok(())
}

#[test]
fn force_reducer_lets_later_explicit_answers_override() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            addHook("ShouldDamage", function() return false end)
            addHook("ShouldDamage", function() return true end)
            addHook("ShouldDamage", function() return nil end)
        "#,
        "force.lua",
    )?;
    let target = session.spawn_actor(1);
    let verdict = session.fire_should_damage(target, None, None, 10);
    assert_eq!(
        verdict,
        Verdict::Allow,
        "the explicit true must override the earlier false; trailing nil must not"
    );
    Ok(())
}

#[test]
fn veto_reducer_is_sticky() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            addHook("TeamSwitch", function() return false end)
            addHook("TeamSwitch", function() return true end)
        "#,
        "veto.lua",
    )?;
    assert!(
        !session.fire_team_switch(0, 2),
        "a later truthy answer cannot undo the veto"
    );
    Ok(())
}

#[test]
fn accumulating_reducer_sums_bonuses() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            addHook("ScoreAward", function(slot, base) return 10 end)
            addHook("ScoreAward", function(slot, base) return 5 end)
            addHook("ScoreAward", function(slot, base) end)
        "#,
        "sum.lua",
    )?;
    assert_eq!(session.fire_score_award(0, 100), 115);
    Ok(())
}

#[test]
fn music_overlay_keeps_earlier_slots_unless_overwritten() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            addHook("MusicChange", function() return {name = "alpha", looping = true} end)
            addHook("MusicChange", function() return {name = "beta"} end)
        "#,
        "music.lua",
    )?;
    let directive = session.fire_music_change("title", "stage1");
    assert_eq!(directive.name.as_deref(), Some("beta"));
    assert_eq!(
        directive.looping,
        Some(true),
        "absent slots must leave the earlier value in place"
    );
    assert!(!directive.suppress);
    Ok(())
}

#[test]
fn unknown_names_and_bad_kinds_fail_registration() -> Result<()> {
    let session = new_session()?;
    assert!(
        session
            .load("addHook(\"NotAHook\", function() end)", "unknown.lua")
            .is_err(),
        "unknown hook names must be rejected"
    );
    assert!(
        session
            .load(
                "addHook(\"ActorThink\", function() end, 9999)",
                "badkind.lua"
            )
            .is_err(),
        "out-of-range actor kinds must be rejected"
    );
    Ok(())
}

#[test]
fn hooks_registered_mid_dispatch_join_the_next_firing() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            count = 0
            addHook("ThinkFrame", function()
                if count == 0 then
                    addHook("ThinkFrame", function() count = count + 100 end)
                end
                count = count + 1
            end)
        "#,
        "reentrant.lua",
    )?;
    session.fire_think_frame();
    let count: i64 = session.eval("count")?;
    assert_eq!(count, 1, "the new hook must not run in the firing that added it");
    session.fire_think_frame();
    let count: i64 = session.eval("count")?;
    assert_eq!(count, 102);
    Ok(())
}

#[test]
fn hud_dispatch_passes_the_drawer_and_blocks_registration() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            drawn = {}
            hud.add(function(v) table.insert(drawn, v.label) end, "game")
            hudError = nil
            hud.add(function(v)
                local ok, err = pcall(function()
                    addHook("ThinkFrame", function() end)
                end)
                if not ok then hudError = tostring(err) end
            end, "game")
        "#,
        "hud.lua",
    )?;
    let drawer = session.lua().create_table()?;
    drawer.set("label", "frame1")?;
    session.fire_hud(HudLayer::Game, Value::Table(drawer))?;

    let label: String = session.eval("drawn[1]")?;
    assert_eq!(label, "frame1");
    let blocked: bool = session.eval("hudError ~= nil and hudError:find('drawing') ~= nil")?;
    assert!(blocked, "addHook must be rejected while a HUD layer draws");
    Ok(())
}

#[test]
fn oversized_trigger_dispatch_is_rejected_before_invocation() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            fired = false
            addHook("TriggerExecute", function() fired = true end, "gate")
        "#,
        "args.lua",
    )?;
    let extra = vec![Value::Nil; ember_script::MAX_DISPATCH_ARGS];
    let result = session.fire_trigger("GATE", None, None, &extra);
    assert!(result.is_err(), "the oversized dispatch must be abandoned");
    let fired: bool = session.eval("fired")?;
    assert!(!fired, "no callback may run for an abandoned dispatch");

    // A later, well-formed firing still works.
    assert!(session.fire_trigger("GATE", None, None, &[])?);
    let fired: bool = session.eval("fired")?;
    assert!(fired);
    Ok(())
}

#[test]
fn profiled_frames_record_per_callback_samples() -> Result<()> {
    let session = new_session()?;
    session.load(
        "addHook(\"ThinkFrame\", function() local n = 0 for i = 1, 100 do n = n + i end end)",
        "profile.lua",
    )?;
    session.set_profiling(true);
    session.fire_think_frame();
    session.fire_think_frame();
    let samples = session.take_profile();
    assert_eq!(samples.len(), 2, "one sample per profiled invocation");
    assert!(samples.iter().all(|sample| sample.event == "ThinkFrame"));
    Ok(())
}

#[test]
fn hooks_survive_clear_level_but_actors_do_not() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            thinks = 0
            addHook("ThinkFrame", function() thinks = thinks + 1 end)
        "#,
        "level.lua",
    )?;
    let actor = session.spawn_actor(1);
    session.fire_think_frame();
    session.clear_level()?;
    session.fire_think_frame();
    let thinks: i64 = session.eval("thinks")?;
    assert_eq!(thinks, 2, "hooks must live across level changes");
    assert!(
        !session.world().borrow().is_live(actor),
        "level actors must be gone after clear_level"
    );
    Ok(())
}

#[test]
fn despawned_actors_report_invalid_to_scripts() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            seen = nil
            addHook("ActorSpawn", function(actor) seen = actor end)
            removedValid = nil
            addHook("ActorRemoved", function(actor) removedValid = actor.valid end)
        "#,
        "lifetime.lua",
    )?;
    let handle = session.spawn_actor(2);
    let valid: bool = session.eval("seen.valid")?;
    assert!(valid);

    assert!(session.despawn_actor(handle));
    let removed_valid: bool = session.eval("removedValid")?;
    assert!(removed_valid, "the Removed hook still sees a live actor");
    let valid: bool = session.eval("seen.valid")?;
    assert!(!valid, "a stale handle must report itself invalid");
    let errors: bool = session.eval("not pcall(function() return seen.health end)")?;
    assert!(errors, "field access through a stale handle must raise");
    Ok(())
}
