use smithay_mirror::{
    backend::{
        select::{BackendSelector, Capabilities, SelectError, TargetClass},
        BackendError, BackendKind,
    },
    config::BackendMode,
    target::{TargetParseError, TargetSpec},
};

fn only(kind: BackendKind) -> Capabilities {
    let mut caps = Capabilities {
        shm: true,
        ..Capabilities::default()
    };
    match kind {
        BackendKind::ExportDmabuf => caps.export_dmabuf = true,
        BackendKind::ScreencopyShm => caps.screencopy = true,
        BackendKind::ScreencopyDmabuf => {
            caps.shm = false;
            caps.screencopy = true;
            caps.linux_dmabuf = true;
            caps.allocator = true;
        }
        BackendKind::ExtCopyShm => {
            caps.image_copy_capture = true;
            caps.output_source = true;
        }
        BackendKind::ExtCopyDmabuf => {
            caps.shm = false;
            caps.image_copy_capture = true;
            caps.output_source = true;
            caps.linux_dmabuf = true;
            caps.allocator = true;
        }
        BackendKind::XdgPortal => caps.media_transport = true,
    }
    caps
}

#[test]
fn auto_picks_the_only_advertised_transport() {
    for kind in BackendMode::Auto.candidates().iter().copied() {
        let caps = only(kind);
        let mut attempted = Vec::new();
        let chosen = BackendSelector::new(BackendMode::Auto)
            .select(&caps, TargetClass::Output, |candidate| {
                attempted.push(candidate);
                Ok::<_, BackendError>(candidate)
            })
            .unwrap();
        assert_eq!(chosen, kind);
        assert_eq!(attempted, vec![kind], "only {} should be attempted", kind);
    }
}

#[test]
fn auto_prefers_earlier_candidates() {
    let caps = Capabilities {
        shm: true,
        screencopy: true,
        export_dmabuf: true,
        image_copy_capture: true,
        output_source: true,
        ..Capabilities::default()
    };
    let mut selector = BackendSelector::new(BackendMode::Auto);
    let order: Vec<_> = std::iter::from_fn(|| selector.fallback(&caps, TargetClass::Output, Ok::<_, BackendError>).ok())
        .collect();
    assert_eq!(
        order,
        vec![
            BackendKind::ExtCopyShm,
            BackendKind::ScreencopyShm,
            BackendKind::ExportDmabuf
        ]
    );
}

#[test]
fn explicit_mode_with_missing_capability_is_exhausted() {
    let caps = only(BackendKind::ScreencopyShm);
    let mut selector = BackendSelector::new(BackendMode::ExportDmabuf);
    let result = selector.select(&caps, TargetClass::Output, |_| -> Result<(), BackendError> {
        panic!("no candidate should be constructed")
    });
    assert!(matches!(result, Err(SelectError::Exhausted(BackendMode::ExportDmabuf))));
}

#[test]
fn toplevel_targets_skip_output_only_transports() {
    let caps = Capabilities {
        shm: true,
        screencopy: true,
        export_dmabuf: true,
        media_transport: true,
        ..Capabilities::default()
    };
    let chosen = BackendSelector::new(BackendMode::Auto)
        .select(&caps, TargetClass::Toplevel, Ok::<_, BackendError>)
        .unwrap();
    assert_eq!(chosen, BackendKind::XdgPortal);
}

#[test]
fn target_strings() {
    assert_eq!("null:".parse::<TargetSpec>(), Ok(TargetSpec::Null));
    assert_eq!(
        "output:eDP-1".parse::<TargetSpec>(),
        Ok(TargetSpec::Output("eDP-1".into()))
    );
    assert_eq!("eDP-1".parse::<TargetSpec>(), "output:eDP-1".parse::<TargetSpec>());
    assert_eq!(
        "toplevel:xyz".parse::<TargetSpec>(),
        Ok(TargetSpec::Toplevel("xyz".into()))
    );
    assert_eq!(
        "bogus:xyz".parse::<TargetSpec>(),
        Err(TargetParseError::UnknownPrefix("bogus".into()))
    );
}
