//! Over-the-air install manifests for iOS packages.
//!
//! Devices install from `itms-services://?action=download-manifest&url=...`
//! pointing at a property list that names the package and its icon.

const TEMPLATE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<plist version="1.0">
  <dict>
    <key>items</key>
    <array>
      <dict>
        <key>assets</key>
        <array>
          <dict>
            <key>kind</key>
            <string>software-package</string>
            <key>url</key>
            <string>{{pkg}}</string>
          </dict>
          <dict>
            <key>kind</key>
            <string>display-image</string>
            <key>needs-shine</key>
            <true/>
            <key>url</key>
            <string>{{icon}}</string>
          </dict>
        </array>
        <key>metadata</key>
        <dict>
          <key>bundle-identifier</key>
          <string>{{identifier}}</string>
          <key>bundle-version</key>
          <string>{{version}}</string>
          <key>kind</key>
          <string>software</string>
          <key>title</key>
          <string>{{name}}</string>
        </dict>
      </dict>
    </array>
  </dict>
</plist>
"#;

/// Values substituted into the manifest.
#[derive(Debug, Clone, Default)]
pub struct InstallItem {
    pub pkg: String,
    pub icon: String,
    pub identifier: String,
    pub version: String,
    pub name: String,
}

/// The manifest template. Built once at startup and handed to the ingest
/// pipeline.
#[derive(Debug, Clone)]
pub struct InstallManifest {
    template: String,
}

impl Default for InstallManifest {
    fn default() -> Self {
        Self::new(TEMPLATE)
    }
}

impl InstallManifest {
    /// Use a custom template with `{{pkg}}`, `{{icon}}`, `{{identifier}}`,
    /// `{{version}}` and `{{name}}` placeholders.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, item: &InstallItem) -> String {
        let mut out = String::with_capacity(self.template.len() + 256);
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let tail = &rest[start + 2..];
            let Some(end) = tail.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            match item.field(tail[..end].trim()) {
                Some(value) => out.push_str(&escape(value)),
                // unknown placeholders are left as written
                None => out.push_str(&rest[start..start + end + 4]),
            }
            rest = &tail[end + 2..];
        }
        out.push_str(rest);
        out
    }
}

impl InstallItem {
    fn field(&self, key: &str) -> Option<&str> {
        match key {
            "pkg" => Some(&self.pkg),
            "icon" => Some(&self.icon),
            "identifier" => Some(&self.identifier),
            "version" => Some(&self.version),
            "name" => Some(&self.name),
            _ => None,
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::{Dictionary, Value};

    fn first_item(value: &Value) -> &Dictionary {
        value
            .as_dictionary()
            .and_then(|d| d.get("items"))
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(Value::as_dictionary)
            .unwrap()
    }

    fn string<'a>(dict: &'a Dictionary, key: &str) -> &'a str {
        dict.get(key).and_then(Value::as_string).unwrap()
    }

    fn item() -> InstallItem {
        InstallItem {
            pkg: "https://file.example.com/ipa.ipa".into(),
            icon: "https://file.example.com/icon.png".into(),
            identifier: "com.ineva.test".into(),
            version: "1.0".into(),
            name: "Test".into(),
        }
    }

    #[test]
    fn test_renders_parseable_manifest() {
        let xml = InstallManifest::default().render(&item());
        let value = Value::from_reader_xml(xml.as_bytes()).unwrap();

        let entry = first_item(&value);
        let assets = entry.get("assets").and_then(Value::as_array).unwrap();
        let package = assets[0].as_dictionary().unwrap();
        assert_eq!(string(package, "kind"), "software-package");
        assert_eq!(string(package, "url"), "https://file.example.com/ipa.ipa");
        let icon = assets[1].as_dictionary().unwrap();
        assert_eq!(icon.get("needs-shine").and_then(Value::as_boolean), Some(true));

        let metadata = entry.get("metadata").and_then(Value::as_dictionary).unwrap();
        assert_eq!(string(metadata, "bundle-identifier"), "com.ineva.test");
        assert_eq!(string(metadata, "kind"), "software");
        assert_eq!(string(metadata, "title"), "Test");
    }

    #[test]
    fn test_values_are_escaped() {
        let mut item = item();
        item.name = "Tom & Jerry <beta>".into();
        item.pkg = "https://x.example.com/a.ipa?sig=1&exp=2".into();
        let xml = InstallManifest::default().render(&item);
        assert!(xml.contains("<string>Tom &amp; Jerry &lt;beta&gt;</string>"));

        let value = Value::from_reader_xml(xml.as_bytes()).unwrap();
        let metadata = first_item(&value)
            .get("metadata")
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(string(metadata, "title"), "Tom & Jerry <beta>");
    }

    #[test]
    fn test_custom_template() {
        let manifest = InstallManifest::new("{{name}} {{ version }} {{name}} {{other}} {{open");
        assert_eq!(manifest.render(&item()), "Test 1.0 Test {{other}} {{open");

        let mut tricky = item();
        tricky.name = "{{version}}".into();
        assert_eq!(InstallManifest::new("{{name}}").render(&tricky), "{{version}}");
    }
}
