//! The MSU package driver: builds `wusa.exe` command lines for OS update
//! packages.

use std::path::Path;

use ember_bundle_types::{
    manifest::{MsuPackage, Package},
    ActionState,
};

use super::ExecutionRequest;

/// Builds the execution request for an MSU package, or `None` when the
/// action needs no process. Uninstall requires the KB id.
pub fn build_request(
    package: &Package,
    msu: &MsuPackage,
    action: ActionState,
    msu_path: &Path,
) -> Option<ExecutionRequest> {
    let arguments = match action {
        ActionState::Install | ActionState::Repair | ActionState::MinorUpgrade
        | ActionState::MajorUpgrade | ActionState::Modify => vec![
            msu_path.display().to_string(),
            "/quiet".to_owned(),
            "/norestart".to_owned(),
        ],
        ActionState::Uninstall => {
            let kb = msu.kb.as_deref()?;
            vec![
                "/uninstall".to_owned(),
                format!("/kb:{kb}"),
                "/quiet".to_owned(),
                "/norestart".to_owned(),
            ]
        }
        ActionState::None => return None,
    };

    Some(ExecutionRequest {
        package_id: package.id.clone(),
        program: "wusa.exe".to_owned(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ember_bundle_types::{manifest::parse_manifest, ActionState};

    use super::build_request;

    fn msu_package() -> ember_bundle_types::Package {
        let text = r#"<BundleManifest Version="1.0">
  <Registration Id="{B}" DisplayName="T" ProviderKey="k" />
  <Payload Id="p" FilePath="a.msu" Size="1" />
  <Chain>
    <MsuPackage Id="update" KB="KB123456">
      <PayloadRef Id="p" />
    </MsuPackage>
  </Chain>
</BundleManifest>"#;
        parse_manifest(text.as_bytes()).unwrap().chain[0].clone()
    }

    #[test]
    fn test_install_and_uninstall_command_lines() {
        let package = msu_package();
        let msu = match &package.kind {
            ember_bundle_types::PackageKind::Msu(msu) => msu,
            _ => unreachable!(),
        };

        let install =
            build_request(&package, msu, ActionState::Install, Path::new("a.msu")).unwrap();
        assert_eq!(install.program, "wusa.exe");
        assert_eq!(install.arguments[0], "a.msu");

        let uninstall =
            build_request(&package, msu, ActionState::Uninstall, Path::new("a.msu")).unwrap();
        assert_eq!(uninstall.arguments[0], "/uninstall");
        assert_eq!(uninstall.arguments[1], "/kb:KB123456");
    }
}
