mod cli;

use std::fs;

use anyhow::{Context, Result};
use ember_script::{ActorEvent, ScriptSession, SessionOptions};

fn main() -> Result<()> {
    let args = cli::parse();

    let session = ScriptSession::new(SessionOptions {
        verbose: args.verbose,
        ..SessionOptions::default()
    })?;

    // A small demo world: two players, some geometry, a few actors.
    session.join_player(0, "ember");
    session.join_player(1, "cinder");
    {
        let world = session.world();
        let mut world = world.borrow_mut();
        world.add_sector(0);
        world.add_vertex(0.0, 0.0);
        world.add_vertex(64.0, 0.0);
        world.add_line(args.trigger.as_deref());
    }
    let mut actors = Vec::new();
    for kind in 0..args.actors {
        actors.push(session.spawn_actor(kind));
    }

    for path in &args.scripts {
        let source = fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?;
        session.load(&source, &path.display().to_string())?;
    }

    if let Some(path) = &args.load {
        let bytes =
            fs::read(path).with_context(|| format!("reading archive {}", path.display()))?;
        session.unarchive(&bytes)?;
        println!("Restored scripting state from {}", path.display());
    }

    session.set_profiling(args.profile);
    session.fire_map_load(1);
    for _ in 0..args.ticks {
        session.fire_pre_think_frame();
        for handle in &actors {
            session.fire_actor_hook(ActorEvent::Think, *handle);
        }
        session.fire_think_frame();
        session.fire_post_think_frame();
    }

    if let Some(tag) = args.trigger.as_deref() {
        let hooked = session.fire_trigger(
            &tag.to_ascii_uppercase(),
            Some(0),
            actors.first().copied(),
            &[],
        )?;
        println!(
            "trigger {tag}: {}",
            if hooked { "handled" } else { "no hooks" }
        );
    }

    if let Some(path) = &args.save {
        let bytes = session.archive()?;
        fs::write(path, &bytes)
            .with_context(|| format!("writing archive to {}", path.display()))?;
        println!(
            "Saved scripting state to {} ({} bytes)",
            path.display(),
            bytes.len()
        );
    }

    if let Some(path) = &args.registry_json {
        let json = serde_json::to_string_pretty(&session.registry_summary())
            .context("serializing the hook registry summary")?;
        fs::write(path, &json)
            .with_context(|| format!("writing registry summary to {}", path.display()))?;
        println!("Saved hook registry summary to {}", path.display());
    }

    if args.profile {
        for sample in session.take_profile() {
            println!(
                "{} #{}: {}us",
                sample.event,
                sample.callback,
                sample.duration.as_micros()
            );
        }
    }

    if args.verbose {
        session.dump_summary();
    }
    session.fire_game_quit();
    Ok(())
}
