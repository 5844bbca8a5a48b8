//! Writes a small scene graph with sharing, a cycle and a subclass, prints
//! the inspector report, and reads it back.
//! Run: cargo run --example inspect_debug

#![allow(missing_docs)]

use std::sync::Arc;

use bamcode::{Bam, BamObject, Ptr, Registry, WritableRef};

#[derive(Debug, Default, BamObject)]
struct Node {
    name: String,
    #[bam(pointer)]
    parent: Ptr<Node>,
    #[bam(pointer)]
    children: Vec<Ptr<Node>>,
}

#[derive(Debug, Default, BamObject)]
struct Light {
    #[bam(base)]
    node: Node,
    intensity: f32,
}

#[derive(Debug, Default, BamObject)]
struct Scene {
    #[bam(pointer)]
    root: Ptr<Node>,
    #[bam(pointer)]
    lights: Vec<Ptr<Light>>,
}

fn main() -> bamcode::Result<()> {
    let mut registry = Registry::new();
    registry.register::<Node>();
    registry.register::<Light>();
    registry.register::<Scene>();
    let registry = Arc::new(registry);

    println!("=== BAMCODE SCENE DEMO ===");

    let root = WritableRef::new(Node {
        name: "root".into(),
        ..Default::default()
    });
    let root_ptr = Ptr::<Node>::new(root.clone())?;
    let mut children = Vec::new();
    for i in 0..3 {
        children.push(Ptr::from_value(Node {
            name: format!("child_{i}"),
            parent: root_ptr.clone(),
            children: Vec::new(),
        }));
    }
    if let Some(mut node) = root.downcast_mut::<Node>() {
        node.children = children;
    }

    let lamp = Ptr::from_value(Light {
        node: Node {
            name: "lamp".into(),
            parent: root_ptr.clone(),
            children: Vec::new(),
        },
        intensity: 0.8,
    });
    let scene = WritableRef::new(Scene {
        root: root_ptr,
        lights: vec![lamp.clone(), lamp],
    });

    let path = std::env::temp_dir().join("bamcode_scene.bam");
    Bam::save(&path, &registry, &scene)?;

    let report = Bam::inspect(&path)?;
    println!("{}", report);

    let loaded = Bam::load(&path, &registry)?;
    if let Some(scene) = loaded.downcast_ref::<Scene>() {
        assert!(scene.lights[0].ptr_eq(&scene.lights[1]));
        let children = scene.root.borrow().map(|r| r.children.len()).unwrap_or(0);
        assert_eq!(children, 3);
        println!(">> Scene Integrity Verified!");
    }

    // Children point back at their parent; break the cycles before exit.
    for graph in [&scene, &loaded] {
        if let Some(scene) = graph.downcast_ref::<Scene>()
            && let Some(mut root) = scene.root.borrow_mut()
        {
            root.children.clear();
        }
    }
    std::fs::remove_file(&path)?;
    Ok(())
}
